use {
    super::*,
    tokio::time::{interval_at, Instant as TokioInstant},
};

/// Process-wide factory of proxies: places each arriving worker on a proxy
/// with spare capacity and aggregates their statistics.
pub struct Director {
    settings: Arc<Settings>,
    weak: Weak<Director>,
    proxies: Mutex<BTreeMap<u64, Arc<Proxy>>>,
    next_proxy_id: AtomicU64,
    last_total_shares: AtomicU64,
}

impl Director {
    pub fn new(settings: Arc<Settings>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            settings,
            weak: weak.clone(),
            proxies: Mutex::new(BTreeMap::new()),
            next_proxy_id: AtomicU64::new(1),
            last_total_shares: AtomicU64::new(0),
        })
    }

    /// The first proxy with room, in id order; a fresh one when none has.
    /// The lock serializes creation so concurrent arrivals cannot race up
    /// duplicate proxies.
    pub fn next_proxy(&self) -> Arc<Proxy> {
        let mut proxies = self.proxies.lock().unwrap();

        if let Some(proxy) = proxies.values().find(|proxy| proxy.is_ready()) {
            return proxy.clone();
        }

        let id = self.next_proxy_id.fetch_add(1, Ordering::Relaxed);
        let proxy = Proxy::spawn(id, self.weak.clone(), self.settings.clone());

        info!("Starting proxy {id}");
        proxies.insert(id, proxy.clone());

        proxy
    }

    pub(crate) fn remove_proxy(&self, id: u64) {
        self.proxies.lock().unwrap().remove(&id);
        info!("Removed proxy {id}");
    }

    pub fn proxy_count(&self) -> usize {
        self.proxies.lock().unwrap().len()
    }

    /// Snapshot of aggregate activity. Counter reads are advisory: the
    /// proxies keep mutating while this runs.
    pub fn stats(&self) -> Stats {
        let proxies = self.proxies.lock().unwrap();

        let mut workers = 0;
        let mut shares = 0;

        for proxy in proxies.values() {
            workers += proxy.worker_count();
            shares += proxy.shares();
        }

        // alive since the oldest extant proxy; resets if that proxy dies
        let alive = proxies
            .values()
            .next()
            .map(|oldest| oldest.alive_since().elapsed())
            .unwrap_or_default();

        let new_shares = shares.saturating_sub(self.last_total_shares.swap(shares, Ordering::Relaxed));

        Stats {
            alive,
            proxies: proxies.len(),
            workers,
            shares,
            new_shares,
        }
    }

    /// Logs one summary line per stat interval until cancelled.
    pub async fn run_stats(director: Arc<Self>, cancel_token: CancellationToken) {
        let period = director.settings.stat_interval();
        let mut ticker = interval_at(TokioInstant::now() + period, period);

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                _ = ticker.tick() => info!("{}", director.stats()),
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stats {
    pub alive: Duration,
    pub proxies: usize,
    pub workers: usize,
    pub shares: u64,
    pub new_shares: u64,
}

impl Display for Stats {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Alive for {}s  |  {} proxies  |  {} workers  |  {} shares (+{})",
            self.alive.as_secs(),
            self.proxies,
            self.workers,
            self.shares,
            self.new_shares
        )
    }
}
