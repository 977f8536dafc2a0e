use super::*;

/// Jobs queued for delivery while the write pump drains a slow socket.
const JOB_QUEUE_DEPTH: usize = 8;

#[derive(Debug, Deserialize)]
struct Request {
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

/// Stratum-TCP frontend: one serve task per miner connection, each
/// dispatching into the mining service of whatever proxy the director
/// assigned.
pub struct Listener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Listener {
    pub async fn bind(settings: &Arc<Settings>) -> Result<Self> {
        let address = format!("{}:{}", settings.address(), settings.stratum_port());

        let listener = TcpListener::bind(&address)
            .await
            .with_context(|| format!("failed to bind stratum listener on {address}"))?;

        let local_addr = listener
            .local_addr()
            .context("failed to read listener address")?;

        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn serve(self, director: Arc<Director>, cancel_token: CancellationToken) -> Result {
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    info!("Stratum listener shutting down");
                    break;
                }

                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, socket_addr)) => {
                            let director = director.clone();
                            tokio::spawn(async move {
                                if let Err(err) = serve_connection(stream, socket_addr, director).await {
                                    debug!("Worker {socket_addr} disconnected with error: {err:#}");
                                }
                            });
                        }
                        Err(err) => warn!("Accept error: {err}"),
                    }
                }
            }
        }

        Ok(())
    }
}

struct TcpWorker {
    id: AtomicU64,
    proxy: Mutex<Option<Arc<Proxy>>>,
    jobs: mpsc::Sender<SubJob>,
    closed: CancellationToken,
}

impl Worker for TcpWorker {
    fn id(&self) -> u64 {
        self.id.load(Ordering::Relaxed)
    }

    fn set_id(&self, id: u64) {
        self.id.store(id, Ordering::Relaxed);
    }

    fn set_proxy(&self, proxy: Arc<Proxy>) {
        *self.proxy.lock().unwrap() = Some(proxy);
    }

    fn proxy(&self) -> Option<Arc<Proxy>> {
        self.proxy.lock().unwrap().clone()
    }

    fn new_job(&self, job: SubJob) {
        if self.jobs.try_send(job).is_err() {
            // the write pump is wedged or gone
            self.disconnect();
        }
    }

    fn disconnect(&self) {
        self.closed.cancel();
    }
}

async fn serve_connection(
    stream: TcpStream,
    socket_addr: SocketAddr,
    director: Arc<Director>,
) -> Result {
    let (read, write) = stream.into_split();

    let mut reader = FramedRead::new(read, LinesCodec::new_with_max_length(MAX_MESSAGE_SIZE));
    let mut writer = FramedWrite::new(write, LinesCodec::new());

    let (jobs_tx, mut jobs) = mpsc::channel(JOB_QUEUE_DEPTH);

    let worker = Arc::new(TcpWorker {
        id: AtomicU64::new(0),
        proxy: Mutex::new(None),
        jobs: jobs_tx,
        closed: CancellationToken::new(),
    });

    let capability: Arc<dyn Worker> = worker.clone();

    director.next_proxy().add(capability.clone()).await;

    debug!("Worker {} connected from {socket_addr}", worker.id());

    let result = serve_loop(&mut reader, &mut writer, &worker, &capability, &mut jobs).await;

    if let Some(proxy) = worker.proxy() {
        proxy.remove(worker.id()).await;
    }

    debug!("Worker {} from {socket_addr} detached", worker.id());

    result
}

async fn serve_loop(
    reader: &mut FramedRead<tokio::net::tcp::OwnedReadHalf, LinesCodec>,
    writer: &mut FramedWrite<tokio::net::tcp::OwnedWriteHalf, LinesCodec>,
    worker: &Arc<TcpWorker>,
    capability: &Arc<dyn Worker>,
    jobs: &mut mpsc::Receiver<SubJob>,
) -> Result {
    loop {
        tokio::select! {
            _ = worker.closed.cancelled() => break,

            Some(job) = jobs.recv() => {
                let frame = serde_json::to_string(&json!({
                    "jsonrpc": "2.0",
                    "method": "job",
                    "params": job,
                }))?;
                writer.send(frame).await?;
            }

            line = reader.next() => {
                let Some(line) = line else {
                    break;
                };

                let request = match serde_json::from_str::<Request>(&line?) {
                    Ok(request) => request,
                    Err(err) => {
                        warn!("Unparseable request from worker {}: {err}", worker.id());
                        let frame = serde_json::to_string(&json!({
                            "id": Value::Null,
                            "jsonrpc": "2.0",
                            "result": Value::Null,
                            "error": RpcError { code: -32700, message: "parse error".into() },
                        }))?;
                        writer.send(frame).await?;
                        continue;
                    }
                };

                let outcome = mining::dispatch(capability, &request.method, request.params).await;

                // a request without an id is a notification: do not respond
                if request.id.is_null() {
                    continue;
                }

                let response = match outcome {
                    Ok(result) => json!({
                        "id": request.id,
                        "jsonrpc": "2.0",
                        "result": result,
                        "error": Value::Null,
                    }),
                    Err(err) => json!({
                        "id": request.id,
                        "jsonrpc": "2.0",
                        "result": Value::Null,
                        "error": err,
                    }),
                };

                writer.send(serde_json::to_string(&response)?).await?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker_with_queue(depth: usize) -> (TcpWorker, mpsc::Receiver<SubJob>) {
        let (jobs, queue) = mpsc::channel(depth);

        let worker = TcpWorker {
            id: AtomicU64::new(7),
            proxy: Mutex::new(None),
            jobs,
            closed: CancellationToken::new(),
        };

        (worker, queue)
    }

    fn sub_job() -> SubJob {
        SubJob {
            blob: "00".repeat(43),
            job_id: "J1".into(),
            target: "b88d0600".into(),
        }
    }

    #[tokio::test]
    async fn jobs_queue_until_the_pump_drains_them() {
        let (worker, mut queue) = worker_with_queue(8);

        worker.new_job(sub_job());
        assert!(!worker.closed.is_cancelled());
        assert_eq!(queue.recv().await.unwrap().job_id, "J1");
    }

    #[tokio::test]
    async fn wedged_worker_is_disconnected_on_queue_overflow() {
        let (worker, _queue) = worker_with_queue(1);

        worker.new_job(sub_job());
        assert!(!worker.closed.is_cancelled());

        worker.new_job(sub_job());
        assert!(worker.closed.is_cancelled());
    }

    #[tokio::test]
    async fn listener_reports_its_ephemeral_port() {
        let options = Options::try_parse_from([
            "hornet",
            "--pool",
            "pool.example.com:3333",
            "--login",
            "wallet",
            "--pass",
            "x",
            "--address",
            "127.0.0.1",
            "--stratum-port",
            "0",
        ])
        .unwrap();

        let settings = Arc::new(Settings::load(options).unwrap());
        let listener = Listener::bind(&settings).await.unwrap();

        assert_ne!(listener.local_addr().port(), 0);
    }
}
