use {
    super::*,
    std::future::pending,
    tokio::time::{interval_at, Instant as TokioInstant},
};

pub(crate) const MAX_PROXY_WORKERS: usize = 1024;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5 * 60);
const DONATE_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the donation connection stays open after a cycle ends, letting
/// in-flight donation shares complete.
const DONATE_SHUTDOWN_DELAY: Duration = Duration::from_secs(30);

/// Grace period between disconnecting workers and leaving the director.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(60);

type WorkerMap = HashMap<u64, Arc<dyn Worker>>;

#[derive(Debug, Deserialize)]
struct PoolLoginReply {
    id: String,
    #[serde(default)]
    job: Value,
}

pub(crate) struct Submission {
    share: Share,
    reply: oneshot::Sender<Result<StatusReply, ShareError>>,
}

enum ShareRoute {
    Primary,
    Donate,
}

/// The four job slots and the donation flag share one mutex: they are the
/// only proxy state touched from outside the run loop's own task.
#[derive(Default)]
struct JobSlots {
    donating: bool,
    current: Option<Job>,
    previous: Option<Job>,
    donate_current: Option<Job>,
    donate_previous: Option<Job>,
}

impl JobSlots {
    fn route(&self, job_id: &str) -> Option<ShareRoute> {
        let matches = |slot: &Option<Job>| slot.as_ref().is_some_and(|job| job.id() == job_id);

        if matches(&self.current) || matches(&self.previous) {
            Some(ShareRoute::Primary)
        } else if matches(&self.donate_current) || matches(&self.donate_previous) {
            Some(ShareRoute::Donate)
        } else {
            None
        }
    }

    fn find_mut(&mut self, job_id: &str) -> Option<&mut Job> {
        [
            &mut self.current,
            &mut self.previous,
            &mut self.donate_current,
            &mut self.donate_previous,
        ]
        .into_iter()
        .flat_map(Option::as_mut)
        .find(|job| job.id() == job_id)
    }

    /// The job new sub-jobs are carved from right now.
    fn active_mut(&mut self) -> Option<&mut Job> {
        if self.donating {
            self.donate_current.as_mut()
        } else {
            self.current.as_mut()
        }
    }
}

struct RunChannels {
    add: mpsc::Receiver<Arc<dyn Worker>>,
    del: mpsc::Receiver<u64>,
    submissions: mpsc::Receiver<Submission>,
    donations: mpsc::Receiver<Submission>,
}

/// One upstream pool session fanned out to up to [`MAX_PROXY_WORKERS`]
/// workers. All mutation happens on the run-loop task; the handle side is
/// channels, atomics, and the job-slot mutex.
pub struct Proxy {
    id: u64,
    weak: Weak<Proxy>,
    settings: Arc<Settings>,
    director: Weak<Director>,
    alive_since: Instant,
    ready: AtomicBool,
    shares: AtomicU64,
    worker_count: AtomicUsize,
    next_worker_id: AtomicU64,
    auth_id: Mutex<String>,
    slots: Mutex<JobSlots>,
    first_job: watch::Receiver<bool>,
    add_tx: mpsc::Sender<Arc<dyn Worker>>,
    del_tx: mpsc::Sender<u64>,
    submissions_tx: mpsc::Sender<Submission>,
    donations_tx: mpsc::Sender<Submission>,
}

impl Proxy {
    pub(crate) fn spawn(id: u64, director: Weak<Director>, settings: Arc<Settings>) -> Arc<Self> {
        let (add_tx, add_rx) = mpsc::channel(1);
        let (del_tx, del_rx) = mpsc::channel(1);
        // share queues are depth one: a submitting worker blocks until the
        // run loop takes its share, which is the flow control
        let (submissions_tx, submissions_rx) = mpsc::channel(1);
        let (donations_tx, donations_rx) = mpsc::channel(1);
        let (first_job_tx, first_job_rx) = watch::channel(false);

        let proxy = Arc::new_cyclic(|weak| Self {
            id,
            weak: weak.clone(),
            settings,
            director,
            alive_since: Instant::now(),
            ready: AtomicBool::new(true),
            shares: AtomicU64::new(0),
            worker_count: AtomicUsize::new(0),
            next_worker_id: AtomicU64::new(1),
            auth_id: Mutex::new(String::new()),
            slots: Mutex::new(JobSlots::default()),
            first_job: first_job_rx,
            add_tx,
            del_tx,
            submissions_tx,
            donations_tx,
        });

        let channels = RunChannels {
            add: add_rx,
            del: del_rx,
            submissions: submissions_rx,
            donations: donations_rx,
        };

        tokio::spawn(proxy.clone().run(channels, first_job_tx));

        proxy
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn shares(&self) -> u64 {
        self.shares.load(Ordering::Relaxed)
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count.load(Ordering::Relaxed)
    }

    pub(crate) fn alive_since(&self) -> Instant {
        self.alive_since
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
            && self.worker_count.load(Ordering::Relaxed) < MAX_PROXY_WORKERS
    }

    /// Attaches a worker: assigns its id, stores the back-reference, and
    /// hands it to the run loop. Safe for concurrent use.
    pub async fn add(&self, worker: Arc<dyn Worker>) {
        let Some(proxy) = self.weak.upgrade() else {
            worker.disconnect();
            return;
        };

        worker.set_proxy(proxy);
        worker.set_id(self.next_worker_id.fetch_add(1, Ordering::Relaxed));

        if let Err(refused) = self.add_tx.send(worker).await {
            // the run loop is gone; push the miner back through the director
            refused.0.disconnect();
        }
    }

    /// Detaches a worker by id. Safe for concurrent use.
    pub async fn remove(&self, worker_id: u64) {
        let _ = self.del_tx.send(worker_id).await;
    }

    /// The next sub-job on the active upstream job. Blocks until the first
    /// job has arrived from the pool.
    pub async fn next_job(&self) -> Result<SubJob> {
        let mut first_job = self.first_job.clone();
        first_job
            .wait_for(|ready| *ready)
            .await
            .map_err(|_| anyhow!("proxy {} has shut down", self.id))?;

        let mut slots = self.slots.lock().unwrap();

        let job = slots
            .active_mut()
            .ok_or_else(|| anyhow!("no job available on proxy {}", self.id))?;

        Ok(job.next_sub_job())
    }

    /// Takes a worker share, routes it to the pool connection owning its
    /// job, and waits for the verdict. Every queued share is answered
    /// exactly once. Safe for concurrent use.
    pub async fn submit(&self, params: Value) -> Result<StatusReply, ShareError> {
        let share = Share::from_params(&params);

        if share.job_id.is_empty() {
            return Err(ShareError::BadJobId);
        }

        if share.nonce.is_empty() {
            return Err(ShareError::MalformedShare);
        }

        let route = self
            .slots
            .lock()
            .unwrap()
            .route(&share.job_id)
            .ok_or(ShareError::BadJobId)?;

        let (reply_tx, reply_rx) = oneshot::channel();

        let submission = Submission {
            share,
            reply: reply_tx,
        };

        let queue = match route {
            ShareRoute::Primary => &self.submissions_tx,
            ShareRoute::Donate => &self.donations_tx,
        };

        queue
            .send(submission)
            .await
            .map_err(|_| ShareError::Unavailable)?;

        reply_rx.await.map_err(|_| ShareError::Unavailable)?
    }

    async fn run(self: Arc<Self>, mut channels: RunChannels, first_job: watch::Sender<bool>) {
        let mut workers: WorkerMap = HashMap::new();

        let (client, mut notifications) = loop {
            match self.login(&first_job).await {
                Ok(session) => break session,
                Err(err) => {
                    warn!(
                        "Failed to acquire pool connection, retrying in {}s: {err:#}",
                        self.settings.retry_delay().as_secs()
                    );
                    sleep(self.settings.retry_delay()).await;
                }
            }
        };

        let mut keepalive = interval_at(
            TokioInstant::now() + KEEPALIVE_INTERVAL,
            KEEPALIVE_INTERVAL,
        );

        let donate_start = sleep(self.settings.donate_interval());
        tokio::pin!(donate_start);
        let mut donate_start_armed = true;

        let donate_end = sleep(self.settings.donate_length());
        tokio::pin!(donate_end);
        let mut donate_end_armed = false;

        let mut donate_client: Option<Arc<Client>> = None;
        let mut donate_notifications: Option<mpsc::Receiver<Notification>> = None;

        loop {
            tokio::select! {
                Some(worker) = channels.add.recv() => {
                    workers.insert(worker.id(), worker);
                    self.worker_count.store(workers.len(), Ordering::Relaxed);
                }

                Some(worker_id) = channels.del.recv() => {
                    workers.remove(&worker_id);
                    self.worker_count.store(workers.len(), Ordering::Relaxed);
                }

                Some(submission) = channels.submissions.recv() => {
                    if let Some(err) = self.handle_submit(submission, Some(&client)).await {
                        debug!("Share submission error: {err}");
                        if err.to_string().to_lowercase().contains("banned") {
                            error!("Pool banned this connection - killing proxy {}", self.id);
                            break;
                        }
                    }
                }

                Some(submission) = channels.donations.recv() => {
                    // the donate server handles its own errors
                    if let Some(err) = self.handle_submit(submission, donate_client.as_ref()).await {
                        debug!("Donation share error: {err}");
                    }
                }

                notification = notifications.recv() => {
                    match notification {
                        Some(notification) => self.handle_notification(notification, false, &workers),
                        None => {
                            error!("Lost pool connection - killing proxy {}", self.id);
                            break;
                        }
                    }
                }

                notification = recv_or_pending(&mut donate_notifications) => {
                    match notification {
                        Some(notification) => self.handle_notification(notification, true, &workers),
                        None => donate_notifications = None,
                    }
                }

                () = &mut donate_start, if donate_start_armed => {
                    donate_start_armed = false;
                    if let Some((client, notifications)) = self.donate(&workers).await {
                        donate_client = Some(client);
                        donate_notifications = Some(notifications);
                    }
                    donate_end.as_mut().reset(TokioInstant::now() + self.settings.donate_length());
                    donate_end_armed = true;
                }

                () = &mut donate_end, if donate_end_armed => {
                    donate_end_armed = false;
                    if self.donating() {
                        if let Some(client) = donate_client.clone() {
                            self.undonate(client, &workers);
                        }
                    }
                    donate_start.as_mut().reset(TokioInstant::now() + self.settings.donate_interval());
                    donate_start_armed = true;
                }

                _ = keepalive.tick() => {
                    let auth_id = self.auth_id.lock().unwrap().clone();
                    match client.call::<StatusReply>("keepalived", json!({"id": auth_id})).await {
                        Ok(reply) => debug!("Keepalived response: {}", reply.status),
                        Err(err) => {
                            error!("Keepalive failed - killing proxy {}: {err}", self.id);
                            break;
                        }
                    }
                }
            }
        }

        self.shutdown(&workers).await;
    }

    async fn login(
        &self,
        first_job: &watch::Sender<bool>,
    ) -> Result<(Arc<Client>, mpsc::Receiver<Notification>)> {
        let client = Client::dial(self.settings.pool_addr()).await?;

        let notifications = client
            .notifications()
            .context("notification stream already taken")?;

        let reply: PoolLoginReply = client
            .call(
                "login",
                json!({
                    "login": self.settings.pool_login(),
                    "pass": self.settings.pool_password(),
                }),
            )
            .await?;

        *self.auth_id.lock().unwrap() = reply.id;

        match Job::from_params(&reply.job) {
            Ok(job) => {
                self.install_primary(job);
            }
            Err(err) => {
                // tolerated: wait for the next pushed job
                warn!("Ignoring malformed job in login reply: {err}");
            }
        }

        info!(
            "Proxy {} connected and logged in to {}",
            self.id,
            self.settings.pool_addr()
        );

        // release workers waiting in next_job
        let _ = first_job.send(true);

        Ok((Arc::new(client), notifications))
    }

    fn donating(&self) -> bool {
        self.slots.lock().unwrap().donating
    }

    /// Installs a primary job, returning whether a broadcast should follow.
    fn install_primary(&self, job: Job) -> bool {
        let mut slots = self.slots.lock().unwrap();
        slots.previous = slots.current.take();
        slots.current = Some(job);
        !slots.donating
    }

    fn install_donate(&self, job: Job) -> bool {
        let mut slots = self.slots.lock().unwrap();
        slots.donate_previous = slots.donate_current.take();
        slots.donate_current = Some(job);
        slots.donating
    }

    fn handle_notification(&self, notification: Notification, donate: bool, workers: &WorkerMap) {
        match notification.method.as_str() {
            "job" => match Job::from_params(&notification.params) {
                Ok(job) => {
                    debug!("New {} job: {}", if donate { "donation" } else { "pool" }, job.id());

                    let broadcast = if donate {
                        self.install_donate(job)
                    } else {
                        self.install_primary(job)
                    };

                    if broadcast {
                        self.broadcast(workers);
                    }
                }
                Err(err) => error!("Error processing job from pool: {err}"),
            },
            method => info!(
                "Received notification from pool: method={method} params={}",
                notification.params
            ),
        }
    }

    /// Hands every worker its own window on the active job.
    fn broadcast(&self, workers: &WorkerMap) {
        if workers.is_empty() {
            return;
        }

        debug!("Broadcasting new job to {} workers", workers.len());

        let mut slots = self.slots.lock().unwrap();

        let Some(job) = slots.active_mut() else {
            return;
        };

        for worker in workers.values() {
            worker.new_job(job.next_sub_job());
        }
    }

    async fn handle_submit(
        &self,
        submission: Submission,
        client: Option<&Arc<Client>>,
    ) -> Option<ShareError> {
        let Submission { mut share, reply } = submission;

        let Some(client) = client else {
            debug!("Dropping share with no upstream for job {}", share.job_id);
            let _ = reply.send(Err(ShareError::NoUpstream));
            return Some(ShareError::NoUpstream);
        };

        if let Err(err) = self.validate_share(&share) {
            debug!("Rejecting share: {err}");
            let _ = reply.send(Err(err.clone()));
            return Some(err);
        }

        share.auth_id = self.auth_id.lock().unwrap().clone();

        match client.call::<StatusReply>("submit", json!(share)).await {
            Ok(status) => {
                if status.status == "OK" {
                    self.shares.fetch_add(1, Ordering::Relaxed);
                }
                debug!("Proxy {} share submit response: {}", self.id, status.status);
                let _ = reply.send(Ok(status));
                None
            }
            Err(err) => {
                let err = ShareError::Pool {
                    message: err.to_string(),
                };
                let _ = reply.send(Err(err.clone()));
                Some(err)
            }
        }
    }

    fn validate_share(&self, share: &Share) -> Result<(), ShareError> {
        let mut slots = self.slots.lock().unwrap();

        let Some(job) = slots.find_mut(&share.job_id) else {
            return Err(ShareError::BadJobId);
        };

        share.validate(job, self.settings.share_validation())?;
        job.record_nonce(&share.nonce);

        Ok(())
    }

    /// Opens the donation session for this cycle. Any failure skips the
    /// cycle; the primary session is untouched.
    async fn donate(&self, workers: &WorkerMap) -> Option<(Arc<Client>, mpsc::Receiver<Notification>)> {
        let address = self.settings.donate_addr();

        let client = match Client::dial_timeout(address, DONATE_DIAL_TIMEOUT).await {
            Ok(client) => client,
            Err(err) => {
                debug!("Failed to connect to donate server, skipping cycle: {err}");
                return None;
            }
        };

        let notifications = client.notifications()?;

        let reply: PoolLoginReply = match client.call("login", json!({})).await {
            Ok(reply) => reply,
            Err(err) => {
                debug!("Failed to login to donate server, skipping cycle: {err}");
                return None;
            }
        };

        {
            let mut slots = self.slots.lock().unwrap();
            slots.donating = true;
        }

        match Job::from_params(&reply.job) {
            Ok(job) => {
                if self.install_donate(job) {
                    self.broadcast(workers);
                }
            }
            Err(err) => error!("Error handling job from donation server: {err}"),
        }

        debug!("Proxy {} switched to donation server", self.id);

        Some((Arc::new(client), notifications))
    }

    /// Ends the donation cycle: workers return to the primary job at once,
    /// the donation socket lingers for in-flight shares.
    fn undonate(&self, client: Arc<Client>, workers: &WorkerMap) {
        {
            let mut slots = self.slots.lock().unwrap();
            slots.donating = false;
        }

        tokio::spawn(async move {
            sleep(DONATE_SHUTDOWN_DELAY).await;
            client.close().await;
        });

        self.broadcast(workers);

        debug!("Proxy {} finished donation cycle", self.id);
    }

    async fn shutdown(&self, workers: &WorkerMap) {
        self.ready.store(false, Ordering::Relaxed);

        // workers reconnect through the director and land on a new proxy
        for worker in workers.values() {
            worker.disconnect();
        }

        sleep(SHUTDOWN_GRACE).await;

        if let Some(director) = self.director.upgrade() {
            director.remove_proxy(self.id);
        }
    }
}

async fn recv_or_pending(
    receiver: &mut Option<mpsc::Receiver<Notification>>,
) -> Option<Notification> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => pending().await,
    }
}
