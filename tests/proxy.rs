use {
    clap::Parser,
    hornet::{director::Director, options::Options, settings::Settings, tcp},
    serde_json::{json, Value},
    std::{
        collections::VecDeque,
        net::SocketAddr,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex,
        },
        time::Duration,
    },
    tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
        net::{
            tcp::{OwnedReadHalf, OwnedWriteHalf},
            TcpListener, TcpStream,
        },
        sync::{broadcast, mpsc},
        time::timeout,
    },
    tokio_util::sync::CancellationToken,
};

const WAIT: Duration = Duration::from_secs(5);

fn blob_with_nonce(nonce: u32) -> String {
    let mut blob = vec![0u8; 43];
    blob[39..43].copy_from_slice(&nonce.to_be_bytes());
    hex::encode(blob)
}

fn nonce_of(blob: &str) -> u32 {
    let blob = hex::decode(blob).unwrap();
    u32::from_be_bytes(blob[39..43].try_into().unwrap())
}

fn job_params(job_id: &str) -> Value {
    json!({"blob": blob_with_nonce(0), "job_id": job_id, "target": "b88d0600"})
}

fn result_hex() -> String {
    "ab".repeat(32)
}

/// A 32-byte result whose difficulty window (bytes 24..32, big-endian)
/// holds `value`.
fn result_with_window(value: u64) -> String {
    let mut bytes = [0u8; 32];
    bytes[24..32].copy_from_slice(&value.to_be_bytes());
    hex::encode(bytes)
}

/// In-process pool speaking the upstream side of the protocol: answers
/// login, records submits, replays scripted submit verdicts, and pushes
/// job notifications to every connection.
struct MockPool {
    addr: String,
    submits: mpsc::UnboundedReceiver<Value>,
    pushes: broadcast::Sender<Value>,
    replies: Arc<Mutex<VecDeque<Result<Value, Value>>>>,
    logins: Arc<AtomicUsize>,
}

impl MockPool {
    async fn spawn(initial_job: Value) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let (submits_tx, submits) = mpsc::unbounded_channel();
        let (pushes, _) = broadcast::channel(16);
        let replies: Arc<Mutex<VecDeque<Result<Value, Value>>>> =
            Arc::new(Mutex::new(VecDeque::new()));
        let logins = Arc::new(AtomicUsize::new(0));

        {
            let pushes = pushes.clone();
            let replies = replies.clone();
            let logins = logins.clone();

            tokio::spawn(async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        break;
                    };

                    tokio::spawn(Self::serve_connection(
                        stream,
                        initial_job.clone(),
                        pushes.subscribe(),
                        submits_tx.clone(),
                        replies.clone(),
                        logins.clone(),
                    ));
                }
            });
        }

        Self {
            addr,
            submits,
            pushes,
            replies,
            logins,
        }
    }

    async fn serve_connection(
        stream: TcpStream,
        initial_job: Value,
        mut pushes: broadcast::Receiver<Value>,
        submits: mpsc::UnboundedSender<Value>,
        replies: Arc<Mutex<VecDeque<Result<Value, Value>>>>,
        logins: Arc<AtomicUsize>,
    ) {
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Ok(Some(line)) = line else {
                        break;
                    };

                    let request: Value = serde_json::from_str(&line).unwrap();
                    let id = request["id"].clone();

                    let frame = match request["method"].as_str().unwrap() {
                        "login" => {
                            logins.fetch_add(1, Ordering::SeqCst);
                            json!({
                                "jsonrpc": "2.0",
                                "id": id,
                                "result": {"id": "A", "job": initial_job, "status": "OK"},
                                "error": null,
                            })
                        }
                        "submit" => {
                            submits.send(request["params"].clone()).ok();

                            let scripted = replies.lock().unwrap().pop_front();
                            match scripted.unwrap_or(Ok(json!({"status": "OK"}))) {
                                Ok(result) => json!({
                                    "jsonrpc": "2.0",
                                    "id": id,
                                    "result": result,
                                    "error": null,
                                }),
                                Err(error) => json!({
                                    "jsonrpc": "2.0",
                                    "id": id,
                                    "result": null,
                                    "error": error,
                                }),
                            }
                        }
                        "keepalived" => json!({
                            "jsonrpc": "2.0",
                            "id": id,
                            "result": {"status": "KEEPALIVED"},
                            "error": null,
                        }),
                        other => panic!("mock pool got unexpected method {other}"),
                    };

                    write
                        .write_all(format!("{frame}\n").as_bytes())
                        .await
                        .unwrap();
                }

                push = pushes.recv() => {
                    let Ok(job) = push else {
                        break;
                    };

                    let frame = json!({"jsonrpc": "2.0", "method": "job", "params": job});
                    if write
                        .write_all(format!("{frame}\n").as_bytes())
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }
    }

    fn push_job(&self, job: Value) {
        self.pushes.send(job).unwrap();
    }

    fn script_submit_error(&self, error: Value) {
        self.replies.lock().unwrap().push_back(Err(error));
    }

    async fn next_submit(&mut self) -> Value {
        timeout(WAIT, self.submits.recv())
            .await
            .expect("timed out waiting for a submit")
            .expect("mock pool closed")
    }

    fn no_pending_submits(&mut self) -> bool {
        self.submits.try_recv().is_err()
    }

    fn login_count(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }
}

/// Boots the full stack against a mock pool and returns the director plus
/// the bound stratum address.
async fn spawn_stack(
    pool_addr: &str,
    extra_args: &[&str],
) -> (Arc<Director>, SocketAddr, CancellationToken) {
    let mut args = vec![
        "hornet",
        "--pool",
        pool_addr,
        "--login",
        "wallet",
        "--pass",
        "x",
        "--stratum-port",
        "0",
        "--address",
        "127.0.0.1",
    ];
    args.extend_from_slice(extra_args);

    let options = Options::try_parse_from(args).unwrap();
    let settings = Arc::new(Settings::load(options).unwrap());

    let director = Director::new(settings.clone());
    let listener = tcp::Listener::bind(&settings).await.unwrap();
    let addr = listener.local_addr();

    let cancel_token = CancellationToken::new();
    tokio::spawn(listener.serve(director.clone(), cancel_token.clone()));

    (director, addr, cancel_token)
}

/// A scripted downstream miner.
struct Miner {
    lines: tokio::io::Lines<BufReader<OwnedReadHalf>>,
    write: OwnedWriteHalf,
    next_id: u64,
    notifications: VecDeque<Value>,
}

impl Miner {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, write) = stream.into_split();

        Self {
            lines: BufReader::new(read).lines(),
            write,
            next_id: 1,
            notifications: VecDeque::new(),
        }
    }

    async fn read_frame(&mut self) -> Option<Value> {
        let line = timeout(WAIT, self.lines.next_line())
            .await
            .expect("timed out waiting for a frame")
            .expect("read error")?;
        Some(serde_json::from_str(&line).unwrap())
    }

    /// Sends a request and waits for its response, buffering any job
    /// notifications that arrive in between.
    async fn call(&mut self, method: &str, params: Value) -> Value {
        let id = self.next_id;
        self.next_id += 1;

        let frame = json!({"id": id, "method": method, "params": params});
        self.write
            .write_all(format!("{frame}\n").as_bytes())
            .await
            .unwrap();

        loop {
            let frame = self.read_frame().await.expect("connection closed mid-call");

            if frame.get("method").is_some() {
                self.notifications.push_back(frame);
                continue;
            }

            assert_eq!(frame["id"], json!(id));
            return frame;
        }
    }

    /// The next pushed notification, buffered or fresh.
    async fn next_notification(&mut self) -> Value {
        if let Some(frame) = self.notifications.pop_front() {
            return frame;
        }

        loop {
            let frame = self.read_frame().await.expect("connection closed");
            if frame.get("method").is_some() {
                return frame;
            }
        }
    }

    /// Waits for a pushed job with the given id, skipping others.
    async fn wait_for_job(&mut self, job_id: &str) -> Value {
        loop {
            let frame = self.next_notification().await;
            assert_eq!(frame["method"], json!("job"));
            if frame["params"]["job_id"] == json!(job_id) {
                return frame["params"].clone();
            }
        }
    }

    async fn send_raw(&mut self, frame: &str) {
        self.write
            .write_all(format!("{frame}\n").as_bytes())
            .await
            .unwrap();
    }

    /// True once the server closes the connection.
    async fn closed(&mut self) -> bool {
        loop {
            match timeout(WAIT, self.lines.next_line()).await {
                Err(_) => return false,
                Ok(Err(_)) | Ok(Ok(None)) => return true,
                Ok(Ok(Some(_))) => continue,
            }
        }
    }
}

#[tokio::test]
async fn login_fans_out_disjoint_nonce_windows() {
    let pool = MockPool::spawn(job_params("J1")).await;
    let (director, addr, _cancel) = spawn_stack(&pool.addr, &[]).await;

    let mut first = Miner::connect(addr).await;
    let reply = first.call("login", json!({"login": "x"})).await;

    assert_eq!(reply["result"]["id"], json!("1"));
    assert_eq!(reply["result"]["status"], json!("OK"));
    assert_eq!(reply["result"]["job"]["job_id"], json!("J1"));
    assert_eq!(reply["result"]["job"]["target"], json!("b88d0600"));
    assert_eq!(nonce_of(reply["result"]["job"]["blob"].as_str().unwrap()), 0);

    let mut second = Miner::connect(addr).await;
    let reply = second.call("login", json!({"login": "x"})).await;

    assert_eq!(reply["result"]["id"], json!("2"));
    assert_eq!(
        nonce_of(reply["result"]["job"]["blob"].as_str().unwrap()),
        0x7a120
    );

    assert_eq!(director.proxy_count(), 1, "both miners share one proxy");
}

#[tokio::test]
async fn accepted_share_reaches_the_pool_and_counts() {
    let mut pool = MockPool::spawn(job_params("J1")).await;
    let (director, addr, _cancel) = spawn_stack(&pool.addr, &[]).await;

    let mut miner = Miner::connect(addr).await;
    miner.call("login", json!({})).await;

    let reply = miner
        .call(
            "submit",
            json!({"job_id": "J1", "nonce": "00000001", "result": result_hex()}),
        )
        .await;

    assert_eq!(reply["result"]["status"], json!("OK"));
    assert!(reply["error"].is_null());

    let forwarded = pool.next_submit().await;
    assert_eq!(forwarded["id"], json!("A"), "stamped with the pool auth id");
    assert_eq!(forwarded["job_id"], json!("J1"));
    assert_eq!(forwarded["nonce"], json!("00000001"));

    let stats = director.stats();
    assert_eq!(stats.shares, 1);
    assert_eq!(stats.new_shares, 1);

    // the attach lands on the run loop asynchronously
    for _ in 0..100 {
        if director.stats().workers == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(director.stats().workers, 1);
}

#[tokio::test]
async fn duplicate_share_is_rejected_without_contacting_the_pool() {
    let mut pool = MockPool::spawn(job_params("J1")).await;
    let (_director, addr, _cancel) = spawn_stack(&pool.addr, &[]).await;

    let mut miner = Miner::connect(addr).await;
    miner.call("login", json!({})).await;

    let share = json!({"job_id": "J1", "nonce": "00000001", "result": result_hex()});

    let reply = miner.call("submit", share.clone()).await;
    assert_eq!(reply["result"]["status"], json!("OK"));
    pool.next_submit().await;

    let reply = miner.call("submit", share).await;
    assert_eq!(reply["error"]["message"], json!("duplicate share"));
    assert_eq!(reply["error"]["code"], json!(-1));

    assert!(pool.no_pending_submits(), "pool must not see the duplicate");
}

#[tokio::test]
async fn unknown_job_id_is_rejected_synchronously() {
    let mut pool = MockPool::spawn(job_params("J1")).await;
    let (_director, addr, _cancel) = spawn_stack(&pool.addr, &[]).await;

    let mut miner = Miner::connect(addr).await;
    miner.call("login", json!({})).await;

    let reply = miner
        .call(
            "submit",
            json!({"job_id": "BOGUS", "nonce": "00000001", "result": result_hex()}),
        )
        .await;

    assert_eq!(reply["error"]["message"], json!("invalid job id"));
    assert_eq!(reply["error"]["code"], json!(-1));
    assert!(pool.no_pending_submits());
}

#[tokio::test]
async fn job_rotation_keeps_the_previous_job_valid() {
    let mut pool = MockPool::spawn(job_params("J0")).await;
    let (_director, addr, _cancel) = spawn_stack(&pool.addr, &[]).await;

    let mut miner = Miner::connect(addr).await;
    miner.call("login", json!({})).await;

    pool.push_job(job_params("J1"));
    miner.wait_for_job("J1").await;

    pool.push_job(job_params("J2"));
    miner.wait_for_job("J2").await;

    // previous job still accepted
    let reply = miner
        .call(
            "submit",
            json!({"job_id": "J1", "nonce": "00000001", "result": result_hex()}),
        )
        .await;
    assert_eq!(reply["result"]["status"], json!("OK"));
    pool.next_submit().await;

    // current job accepted
    let reply = miner
        .call(
            "submit",
            json!({"job_id": "J2", "nonce": "00000002", "result": result_hex()}),
        )
        .await;
    assert_eq!(reply["result"]["status"], json!("OK"));
    pool.next_submit().await;

    // twice-displaced job rejected
    let reply = miner
        .call(
            "submit",
            json!({"job_id": "J0", "nonce": "00000003", "result": result_hex()}),
        )
        .await;
    assert_eq!(reply["error"]["message"], json!("invalid job id"));
}

#[tokio::test]
async fn broadcast_hands_each_worker_its_own_window() {
    let pool = MockPool::spawn(job_params("J1")).await;
    let (_director, addr, _cancel) = spawn_stack(&pool.addr, &[]).await;

    let mut first = Miner::connect(addr).await;
    first.call("login", json!({})).await;

    let mut second = Miner::connect(addr).await;
    second.call("login", json!({})).await;

    // let both attaches land on the run loop before the job changes
    tokio::time::sleep(Duration::from_millis(200)).await;

    pool.push_job(job_params("J2"));

    let job_a = first.wait_for_job("J2").await;
    let job_b = second.wait_for_job("J2").await;

    let mut nonces = [
        nonce_of(job_a["blob"].as_str().unwrap()),
        nonce_of(job_b["blob"].as_str().unwrap()),
    ];
    nonces.sort_unstable();

    assert_eq!(nonces, [0, 0x7a120], "windows must not overlap");
}

#[tokio::test]
async fn getjob_advances_the_nonce_window() {
    let pool = MockPool::spawn(job_params("J1")).await;
    let (_director, addr, _cancel) = spawn_stack(&pool.addr, &[]).await;

    let mut miner = Miner::connect(addr).await;
    let login = miner.call("login", json!({})).await;
    let first = nonce_of(login["result"]["job"]["blob"].as_str().unwrap());

    let reply = miner.call("getjob", json!({})).await;
    let second = nonce_of(reply["result"]["blob"].as_str().unwrap());

    assert_eq!(second, first + 0x7a120);
}

#[tokio::test]
async fn keepalived_and_auth_serve_compatibility_clients() {
    let pool = MockPool::spawn(job_params("J1")).await;
    let (_director, addr, _cancel) = spawn_stack(&pool.addr, &[]).await;

    let mut miner = Miner::connect(addr).await;

    let reply = miner.call("keepalived", json!({})).await;
    assert_eq!(reply["result"]["status"], json!("KEEPALIVED"));

    let reply = miner.call("auth", json!({"site_key": "k"})).await;
    assert_eq!(reply["result"], json!({"token": "", "hashes": ""}));

    // auth is followed by an asynchronous job push
    let frame = miner.next_notification().await;
    assert_eq!(frame["method"], json!("job"));
    assert_eq!(frame["params"]["job_id"], json!("J1"));
}

#[tokio::test]
async fn share_format_validation_rejects_malformed_shares() {
    let mut pool = MockPool::spawn(job_params("J1")).await;
    let (_director, addr, _cancel) = spawn_stack(&pool.addr, &["--share-validation", "1"]).await;

    let mut miner = Miner::connect(addr).await;
    miner.call("login", json!({})).await;

    let reply = miner
        .call(
            "submit",
            json!({"job_id": "J1", "nonce": "123", "result": result_hex()}),
        )
        .await;
    assert_eq!(reply["error"]["message"], json!("malformed share"));
    assert_eq!(reply["error"]["code"], json!(-1));
    assert!(pool.no_pending_submits());

    let reply = miner
        .call(
            "submit",
            json!({"job_id": "J1", "nonce": "00000001", "result": result_hex()}),
        )
        .await;
    assert_eq!(reply["result"]["status"], json!("OK"));
}

#[tokio::test]
async fn banned_pool_reply_tears_the_proxy_down() {
    let mut pool = MockPool::spawn(job_params("J1")).await;
    let (_director, addr, _cancel) = spawn_stack(&pool.addr, &[]).await;

    let mut miner = Miner::connect(addr).await;
    miner.call("login", json!({})).await;

    pool.script_submit_error(json!({"code": -1, "message": "you are banned"}));

    let reply = miner
        .call(
            "submit",
            json!({"job_id": "J1", "nonce": "00000001", "result": result_hex()}),
        )
        .await;

    assert!(reply["error"]["message"]
        .as_str()
        .unwrap()
        .contains("banned"));
    pool.next_submit().await;

    assert!(miner.closed().await, "workers are disconnected after a ban");
}

#[tokio::test]
async fn difficulty_validation_rejects_low_results() {
    let mut pool = MockPool::spawn(job_params("J1")).await;
    let (_director, addr, _cancel) = spawn_stack(&pool.addr, &["--share-validation", "2"]).await;

    let mut miner = Miner::connect(addr).await;
    miner.call("login", json!({})).await;

    // target b88d0600 widens to 0xb88d0600_00000000
    let reply = miner
        .call(
            "submit",
            json!({"job_id": "J1", "nonce": "00000001", "result": result_with_window(1)}),
        )
        .await;
    assert_eq!(reply["error"]["message"], json!("share difficulty too low"));
    assert_eq!(reply["error"]["code"], json!(-1));
    assert!(pool.no_pending_submits());

    let reply = miner
        .call(
            "submit",
            json!({
                "job_id": "J1",
                "nonce": "00000002",
                "result": result_with_window(u64::MAX),
            }),
        )
        .await;
    assert_eq!(reply["result"]["status"], json!("OK"));
    pool.next_submit().await;
}

#[tokio::test]
async fn disconnected_worker_is_removed_from_its_proxy() {
    let pool = MockPool::spawn(job_params("J1")).await;
    let (director, addr, _cancel) = spawn_stack(&pool.addr, &[]).await;

    {
        let mut miner = Miner::connect(addr).await;
        miner.call("login", json!({})).await;

        for _ in 0..100 {
            if director.stats().workers == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(director.stats().workers, 1);
    }

    // the dropped socket takes the worker with it
    for _ in 0..100 {
        if director.stats().workers == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(director.stats().workers, 0);
}

#[tokio::test]
async fn unparseable_and_unknown_requests_get_error_replies() {
    let pool = MockPool::spawn(job_params("J1")).await;
    let (_director, addr, _cancel) = spawn_stack(&pool.addr, &[]).await;

    let mut miner = Miner::connect(addr).await;

    miner.send_raw("this is not json").await;
    let reply = miner.read_frame().await.unwrap();
    assert_eq!(reply["id"], json!(null));
    assert_eq!(reply["error"]["code"], json!(-32700));

    let reply = miner.call("made_up_method", json!({})).await;
    assert_eq!(reply["error"]["code"], json!(-32601));

    // an id-less request is a notification and draws no response: the
    // next frame on the wire answers the identified call that follows it
    miner
        .send_raw(r#"{"method":"keepalived","params":{}}"#)
        .await;
    let reply = miner.call("keepalived", json!({})).await;
    assert_eq!(reply["result"]["status"], json!("KEEPALIVED"));
}

#[tokio::test]
async fn unreachable_donate_endpoint_skips_the_cycle() {
    let mut pool = MockPool::spawn(job_params("J1")).await;

    // an address nothing listens on
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap().to_string();
    drop(dead);

    let (_director, addr, _cancel) = spawn_stack(
        &pool.addr,
        &[
            "--donate-level",
            "50",
            "--donate-cycle",
            "2",
            "--donate-addr",
            &dead_addr,
        ],
    )
    .await;

    let mut miner = Miner::connect(addr).await;
    miner.call("login", json!({})).await;

    // ride out a full cycle; the primary session must stay undisturbed
    tokio::time::sleep(Duration::from_millis(2500)).await;

    let reply = miner
        .call(
            "submit",
            json!({"job_id": "J1", "nonce": "00000001", "result": result_hex()}),
        )
        .await;
    assert_eq!(reply["result"]["status"], json!("OK"));
    pool.next_submit().await;

    assert!(
        miner.notifications.is_empty(),
        "a skipped donation cycle must not rebroadcast jobs"
    );
}

#[tokio::test]
async fn donation_cycle_switches_jobs_and_share_routing() {
    let mut donate_pool = MockPool::spawn(job_params("JD1")).await;
    let mut pool = MockPool::spawn(job_params("J1")).await;

    let donate_addr = donate_pool.addr.clone();
    let (_director, addr, _cancel) = spawn_stack(
        &pool.addr,
        &[
            "--donate-level",
            "50",
            "--donate-cycle",
            "2",
            "--donate-addr",
            &donate_addr,
        ],
    )
    .await;

    let mut miner = Miner::connect(addr).await;
    let login = miner.call("login", json!({})).await;
    assert_eq!(login["result"]["job"]["job_id"], json!("J1"));

    // one second in, the proxy switches everyone onto the donation job
    miner.wait_for_job("JD1").await;
    assert!(donate_pool.login_count() >= 1);

    let reply = miner
        .call(
            "submit",
            json!({"job_id": "JD1", "nonce": "00000001", "result": result_hex()}),
        )
        .await;
    assert_eq!(reply["result"]["status"], json!("OK"));

    let forwarded = donate_pool.next_submit().await;
    assert_eq!(forwarded["job_id"], json!("JD1"));
    assert!(
        pool.no_pending_submits(),
        "donation share must not hit the primary pool"
    );

    // and back to the primary job when the cycle ends
    miner.wait_for_job("J1").await;

    let reply = miner
        .call(
            "submit",
            json!({"job_id": "J1", "nonce": "00000002", "result": result_hex()}),
        )
        .await;
    assert_eq!(reply["result"]["status"], json!("OK"));
    pool.next_submit().await;
}
