use super::*;

/// Status envelope used on both legs: decoded from upstream `submit` and
/// `keepalived` replies, encoded downstream as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReply {
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct LoginReply {
    pub id: String,
    pub job: SubJob,
    pub status: String,
}

/// Compatibility handshake for browser miners.
#[derive(Debug, Serialize)]
pub struct AuthReply {
    pub token: String,
    pub hashes: String,
}

/// Routes one downstream request to the worker's proxy. Codecs may prefix
/// method names with the service name; the prefix is stripped here.
pub async fn dispatch(
    worker: &Arc<dyn Worker>,
    method: &str,
    params: Value,
) -> Result<Value, RpcError> {
    let method = method.strip_prefix("mining.").unwrap_or(method);

    match method {
        "login" => login(worker).await,
        "getjob" => getjob(worker).await,
        "submit" => submit(worker, params).await,
        "keepalived" => Ok(json!(StatusReply {
            status: "KEEPALIVED".into(),
        })),
        "auth" => auth(worker),
        method => Err(RpcError {
            code: -32601,
            message: format!("method not found: {method}"),
        }),
    }
}

fn internal(message: impl Display) -> RpcError {
    RpcError {
        code: -32603,
        message: message.to_string(),
    }
}

/// Share rejections keep their own code so miners can tell a bad share
/// from a broken proxy.
fn rejected(err: ShareError) -> RpcError {
    RpcError {
        code: -1,
        message: err.to_string(),
    }
}

fn proxy_of(worker: &Arc<dyn Worker>) -> Result<Arc<Proxy>, RpcError> {
    worker
        .proxy()
        .ok_or_else(|| internal("worker is not attached to a proxy"))
}

async fn login(worker: &Arc<dyn Worker>) -> Result<Value, RpcError> {
    let job = proxy_of(worker)?
        .next_job()
        .await
        .map_err(|err| internal(err))?;

    Ok(json!(LoginReply {
        id: worker.id().to_string(),
        job,
        status: "OK".into(),
    }))
}

async fn getjob(worker: &Arc<dyn Worker>) -> Result<Value, RpcError> {
    let job = proxy_of(worker)?
        .next_job()
        .await
        .map_err(|err| internal(err))?;
    Ok(json!(job))
}

async fn submit(worker: &Arc<dyn Worker>, params: Value) -> Result<Value, RpcError> {
    let proxy = proxy_of(worker)?;

    match proxy.submit(params).await {
        Ok(status) => Ok(json!(status)),
        Err(err) => Err(rejected(err)),
    }
}

fn auth(worker: &Arc<dyn Worker>) -> Result<Value, RpcError> {
    // issue the first job only after the reply has gone out; sending it
    // inline would reorder the handshake for browser miners
    let worker = worker.clone();
    tokio::spawn(async move {
        if let Some(proxy) = worker.proxy() {
            match proxy.next_job().await {
                Ok(job) => worker.new_job(job),
                Err(err) => debug!("no job to follow auth reply: {err}"),
            }
        }
    });

    Ok(json!(AuthReply {
        token: String::new(),
        hashes: String::new(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DetachedWorker;

    impl Worker for DetachedWorker {
        fn id(&self) -> u64 {
            7
        }
        fn set_id(&self, _id: u64) {}
        fn set_proxy(&self, _proxy: Arc<Proxy>) {}
        fn proxy(&self) -> Option<Arc<Proxy>> {
            None
        }
        fn new_job(&self, _job: SubJob) {}
        fn disconnect(&self) {}
    }

    fn worker() -> Arc<dyn Worker> {
        Arc::new(DetachedWorker)
    }

    #[tokio::test]
    async fn keepalived_acknowledges_without_a_proxy() {
        let reply = dispatch(&worker(), "keepalived", Value::Null).await.unwrap();
        assert_eq!(reply, json!({"status": "KEEPALIVED"}));
    }

    #[tokio::test]
    async fn service_prefix_is_stripped() {
        let reply = dispatch(&worker(), "mining.keepalived", Value::Null)
            .await
            .unwrap();
        assert_eq!(reply, json!({"status": "KEEPALIVED"}));
    }

    #[tokio::test]
    async fn unknown_methods_report_method_not_found() {
        let err = dispatch(&worker(), "mining.unknown", Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.code, -32601);
    }

    #[tokio::test]
    async fn auth_replies_with_the_compatibility_stub() {
        let reply = dispatch(&worker(), "auth", json!({"site_key": "k"}))
            .await
            .unwrap();
        assert_eq!(reply, json!({"token": "", "hashes": ""}));
    }

    #[tokio::test]
    async fn detached_worker_cannot_login() {
        let err = dispatch(&worker(), "login", Value::Null).await.unwrap_err();
        assert_eq!(err.code, -32603);
    }

    #[test]
    fn share_rejections_use_their_own_error_code() {
        let err = rejected(ShareError::DuplicateShare);
        assert_eq!(err.code, -1);
        assert_eq!(err.message, "duplicate share");

        assert_eq!(rejected(ShareError::BadJobId).code, -1);
        assert_eq!(internal("worker is not attached to a proxy").code, -32603);
    }
}
