use {
    super::*,
    serde::de::DeserializeOwned,
    tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf},
};

pub(crate) const CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Inbound notifications queue up here while the owner is between polls.
/// A full buffer means the owner has stopped consuming, which the
/// surrounding design treats as a broken invariant, not backpressure.
pub(crate) const NOTIFICATION_BUFFER: usize = 10;

/// Some pools reject requests with id 0 or 1, so correlation ids start at 2.
const FIRST_CALL_ID: u64 = 2;

struct PendingCall {
    method: String,
    reply: oneshot::Sender<Result<Value, RpcError>>,
}

/// Framed JSON-RPC 2.0 client for the upstream pool link. The connection
/// is bidirectional: `call` drives request/response pairs correlated by
/// id, while a reader task routes unsolicited notifications into a bounded
/// stream the owner must keep draining.
pub struct Client {
    seq: AtomicU64,
    pending: Arc<Mutex<HashMap<u64, PendingCall>>>,
    writer: tokio::sync::Mutex<FramedWrite<OwnedWriteHalf, LinesCodec>>,
    notifications: Mutex<Option<mpsc::Receiver<Notification>>>,
    reader: JoinHandle<()>,
    call_timeout: Duration,
}

impl Client {
    pub async fn dial(address: &str) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|source| ClientError::Dial {
                address: address.into(),
                source,
            })?;

        Ok(Self::new(stream))
    }

    pub async fn dial_timeout(address: &str, limit: Duration) -> Result<Self, ClientError> {
        match timeout(limit, TcpStream::connect(address)).await {
            Err(_) => Err(ClientError::DialTimedOut {
                address: address.into(),
            }),
            Ok(Err(source)) => Err(ClientError::Dial {
                address: address.into(),
                source,
            }),
            Ok(Ok(stream)) => Ok(Self::new(stream)),
        }
    }

    fn new(stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();

        let reader = FramedRead::new(
            read_half,
            LinesCodec::new_with_max_length(MAX_MESSAGE_SIZE),
        );
        let writer = FramedWrite::new(write_half, LinesCodec::new());

        let (notify_tx, notify_rx) = mpsc::channel(NOTIFICATION_BUFFER);
        let pending = Arc::new(Mutex::new(HashMap::new()));

        let reader = tokio::spawn(Self::read_loop(reader, pending.clone(), notify_tx));

        Self {
            seq: AtomicU64::new(FIRST_CALL_ID),
            pending,
            writer: tokio::sync::Mutex::new(writer),
            notifications: Mutex::new(Some(notify_rx)),
            reader,
            call_timeout: CALL_TIMEOUT,
        }
    }

    #[cfg(test)]
    fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// Takes the inbound notification stream. Yields `Some` on the first
    /// call only; the stream ends when the connection does.
    pub fn notifications(&self) -> Option<mpsc::Receiver<Notification>> {
        self.notifications.lock().unwrap().take()
    }

    /// Sends `method` upstream and awaits the correlated reply, decoded
    /// into `T`. An error member in the reply surfaces as
    /// [`ClientError::Rpc`]; no reply within the call timeout abandons the
    /// outstanding slot and returns [`ClientError::CallTimedOut`].
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, ClientError> {
        let id = self.seq.fetch_add(1, Ordering::Relaxed);

        let (reply_tx, reply_rx) = oneshot::channel();

        self.pending.lock().unwrap().insert(
            id,
            PendingCall {
                method: method.into(),
                reply: reply_tx,
            },
        );

        let frame = match serde_json::to_string(&Message::Request {
            id,
            method: method.into(),
            params,
        }) {
            Ok(frame) => frame,
            Err(source) => {
                self.pending.lock().unwrap().remove(&id);
                return Err(ClientError::Encode {
                    method: method.into(),
                    source,
                });
            }
        };

        if let Err(source) = self.writer.lock().await.send(frame).await {
            self.pending.lock().unwrap().remove(&id);
            return Err(ClientError::Transport { source });
        }

        let outcome = match timeout(self.call_timeout, reply_rx).await {
            Err(_) => {
                self.pending.lock().unwrap().remove(&id);
                return Err(ClientError::CallTimedOut);
            }
            Ok(Err(_)) => return Err(ClientError::ConnectionClosed),
            Ok(Ok(outcome)) => outcome,
        };

        let value = outcome.map_err(|source| ClientError::Rpc { source })?;

        serde_json::from_value(value).map_err(|source| ClientError::BadReply {
            method: method.into(),
            source,
        })
    }

    /// Closes the connection: the reader stops, outstanding calls fail,
    /// and the notification stream ends.
    pub async fn close(&self) {
        self.reader.abort();
        let mut writer = self.writer.lock().await;
        let _ = tokio::io::AsyncWriteExt::shutdown(writer.get_mut()).await;
        self.pending.lock().unwrap().clear();
    }

    async fn read_loop(
        mut reader: FramedRead<OwnedReadHalf, LinesCodec>,
        pending: Arc<Mutex<HashMap<u64, PendingCall>>>,
        notifications: mpsc::Sender<Notification>,
    ) {
        while let Some(line) = reader.next().await {
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    error!("pool read error: {err}");
                    break;
                }
            };

            let message = match serde_json::from_str::<Message>(&line) {
                Ok(message) => message,
                Err(err) => {
                    warn!("malformed frame from pool: {err}");
                    continue;
                }
            };

            match message {
                Message::Response { id, result, error } => {
                    let call = pending.lock().unwrap().remove(&id);

                    let Some(call) = call else {
                        warn!("unmatched response id={id}: {line}");
                        continue;
                    };

                    let outcome = match error {
                        Some(error) => Err(error),
                        None => Ok(result.unwrap_or(Value::Null)),
                    };

                    if call.reply.send(outcome).is_err() {
                        debug!("dropped {} response for abandoned call {id}", call.method);
                    }
                }
                Message::Notification { method, params } => {
                    match notifications.try_send(Notification { method, params }) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            error!("{}", ClientError::NotificationsFull);
                            break;
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => break,
                    }
                }
                Message::Request { method, .. } => {
                    warn!("ignoring request frame from pool: {method}");
                }
            }
        }

        // dropping the reply senders wakes every outstanding caller
        pending.lock().unwrap().clear();
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
