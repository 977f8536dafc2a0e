use super::*;

/// Capability the core drives a connected miner through. Adapters own the
/// socket and codec; the proxy group only ever touches this surface.
pub trait Worker: Send + Sync {
    /// Distinguishes this worker from the others on its proxy.
    fn id(&self) -> u64;

    /// Assigned by the proxy when the worker attaches.
    fn set_id(&self, id: u64);

    /// Stores the back-reference used to submit shares and detach cleanly.
    fn set_proxy(&self, proxy: Arc<Proxy>);

    fn proxy(&self) -> Option<Arc<Proxy>>;

    /// Queues a fresh sub-job for delivery. Must not block: the proxy run
    /// loop calls this for every attached worker on each job change.
    fn new_job(&self, job: SubJob);

    /// Severs the connection. The adapter's teardown path removes the
    /// worker from its proxy; a reconnecting miner lands on a fresh proxy
    /// through the director.
    fn disconnect(&self);
}
