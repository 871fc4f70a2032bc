//! Controller integration boundary

/// The rule-engine controller a pooling manager serves
pub trait PoolingController: Send + Sync {
    /// Controller name, used in logs and property lookup
    fn name(&self) -> &str;

    /// A locked controller takes no part in pooling
    fn is_locked(&self) -> bool;

    /// Inject an event into the controller's rule sessions, bypassing pooling.
    ///
    /// Returns `false` when the controller refused the event.
    fn deliver(&self, protocol: &str, topic: &str, event: &str) -> bool;
}
