//! Correlation of in-flight requests with results that arrive later from
//! transport callbacks.
//!
//! Each key holds at most one outstanding operation. Registering a second
//! operation under an occupied key fails the displaced one with
//! [`BtSerialError::Superseded`] so no caller is left waiting on a result that
//! will be delivered to someone else.
//!
//! Every operation expires on its own once its timeout passes, whether or not
//! anyone is still waiting on its [`Completion`]. The registry's expiry hook
//! runs before the waiting caller (if any) receives the timeout error.

use crate::domain::error::{BtSerialError, BtSerialResult};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

pub type OperationId = Uuid;

/// Cleanup run for an expired operation, given the key it last lived under
/// and the timeout message.
pub type ExpiryHook<K> =
    Arc<dyn Fn(K, String) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Key for connect requests
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConnectKey {
    /// A specific device id
    Device(String),
    /// Whichever device a discovery scan reports first
    FirstAvailable,
}

impl fmt::Display for ConnectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectKey::Device(id) => write!(f, "{}", id),
            ConnectKey::FirstAvailable => write!(f, "<first-available>"),
        }
    }
}

struct PendingEntry<T> {
    op_id: OperationId,
    registered_at: Instant,
    tx: oneshot::Sender<BtSerialResult<T>>,
    timeout_error: BtSerialError,
    expiry: Option<JoinHandle<()>>,
}

impl<T> PendingEntry<T> {
    fn complete(mut self, result: BtSerialResult<T>) {
        self.stop_expiry();
        // A dropped receiver means the caller stopped waiting
        let _ = self.tx.send(result);
    }

    fn stop_expiry(&mut self) {
        if let Some(expiry) = self.expiry.take() {
            expiry.abort();
        }
    }
}

/// Registry of outstanding operations keyed by `K`, each resolving to `T`
pub struct PendingRegistry<K, T> {
    name: &'static str,
    entries: Mutex<HashMap<K, PendingEntry<T>>>,
    on_expire: Option<ExpiryHook<K>>,
}

impl<K, T> PendingRegistry<K, T>
where
    K: Eq + Hash + Clone + fmt::Display + Send + Sync + 'static,
    T: Send + 'static,
{
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            entries: Mutex::new(HashMap::new()),
            on_expire: None,
        })
    }

    /// Registry whose expired operations are handed to `hook` first
    pub fn with_expiry_hook(name: &'static str, hook: ExpiryHook<K>) -> Arc<Self> {
        Arc::new(Self {
            name,
            entries: Mutex::new(HashMap::new()),
            on_expire: Some(hook),
        })
    }

    /// Store a new operation under `key` and hand back its completion.
    ///
    /// If no result arrives within `timeout` the operation is removed and
    /// completed with `timeout_error`.
    pub async fn register(
        self: &Arc<Self>,
        key: K,
        timeout: Duration,
        timeout_error: BtSerialError,
    ) -> Completion<K, T> {
        let (tx, rx) = oneshot::channel();
        let op_id = Uuid::new_v4();
        let entry = PendingEntry {
            op_id,
            registered_at: Instant::now(),
            tx,
            timeout_error,
            expiry: None,
        };

        let displaced = {
            let mut entries = self.entries.lock().await;
            let displaced = entries.insert(key.clone(), entry);
            let expiry = tokio::spawn(Self::expire_after(Arc::downgrade(self), op_id, timeout));
            if let Some(entry) = entries.get_mut(&key) {
                entry.expiry = Some(expiry);
            }
            displaced
        };

        if let Some(old) = displaced {
            warn!(
                "{}: operation {} for '{}' superseded by {}",
                self.name, old.op_id, key, op_id
            );
            old.complete(Err(BtSerialError::Superseded {
                key: key.to_string(),
            }));
        } else {
            debug!("{}: registered operation {} for '{}'", self.name, op_id, key);
        }

        Completion { key, op_id, rx }
    }

    async fn expire_after(registry: Weak<Self>, op_id: OperationId, timeout: Duration) {
        tokio::time::sleep(timeout).await;
        let Some(registry) = registry.upgrade() else {
            return;
        };
        let Some((key, entry)) = registry.take(op_id).await else {
            return;
        };

        // Dropping the handle of this very task detaches it; aborting would
        // cut the hook short
        let PendingEntry { tx, timeout_error, .. } = entry;
        warn!(
            "{}: operation {} for '{}' timed out after {:?}",
            registry.name, op_id, key, timeout
        );
        if let Some(hook) = &registry.on_expire {
            hook(key, timeout_error.to_string()).await;
        }
        let _ = tx.send(Err(timeout_error));
    }

    // Remove operation `op_id` wherever a rekey may have moved it
    async fn take(&self, op_id: OperationId) -> Option<(K, PendingEntry<T>)> {
        let mut entries = self.entries.lock().await;
        let key = entries
            .iter()
            .find(|(_, entry)| entry.op_id == op_id)
            .map(|(k, _)| k.clone())?;
        entries.remove(&key).map(|entry| (key, entry))
    }

    /// Complete the operation under `key` successfully.
    ///
    /// Returns false when nothing was pending, which is not an error: the
    /// caller may already have returned through another path.
    pub async fn resolve(&self, key: &K, value: T) -> bool {
        match self.entries.lock().await.remove(key) {
            Some(entry) => {
                debug!(
                    "{}: resolved operation {} for '{}' after {:?}",
                    self.name,
                    entry.op_id,
                    key,
                    entry.registered_at.elapsed()
                );
                entry.complete(Ok(value));
                true
            }
            None => false,
        }
    }

    /// Complete the operation under `key` with an error
    pub async fn fail(&self, key: &K, error: BtSerialError) -> bool {
        match self.entries.lock().await.remove(key) {
            Some(entry) => {
                debug!(
                    "{}: failed operation {} for '{}': {}",
                    self.name, entry.op_id, key, error
                );
                entry.complete(Err(error));
                true
            }
            None => false,
        }
    }

    /// Move the operation under `from` to `to` without completing it.
    ///
    /// An operation already waiting under `to` is superseded.
    pub async fn rekey(&self, from: &K, to: K) -> bool {
        let displaced = {
            let mut entries = self.entries.lock().await;
            match entries.remove(from) {
                Some(entry) => {
                    debug!(
                        "{}: operation {} moved from '{}' to '{}'",
                        self.name, entry.op_id, from, to
                    );
                    entries.insert(to.clone(), entry)
                }
                None => return false,
            }
        };

        if let Some(old) = displaced {
            old.complete(Err(BtSerialError::Superseded { key: to.to_string() }));
        }
        true
    }

    /// Drop operation `op_id`, looking under `key` first and then wherever a
    /// rekey may have moved it. A newer operation under the same key is left
    /// alone.
    pub async fn cancel(&self, key: &K, op_id: OperationId) -> bool {
        let mut entries = self.entries.lock().await;
        let current_key = match entries.get(key) {
            Some(entry) if entry.op_id == op_id => Some(key.clone()),
            _ => entries
                .iter()
                .find(|(_, entry)| entry.op_id == op_id)
                .map(|(k, _)| k.clone()),
        };

        match current_key.and_then(|k| entries.remove(&k).map(|entry| (k, entry))) {
            Some((k, mut entry)) => {
                entry.stop_expiry();
                debug!("{}: cancelled operation {} for '{}'", self.name, op_id, k);
                true
            }
            None => false,
        }
    }

    /// Fail every outstanding operation
    pub async fn fail_all<F>(&self, make_error: F) -> usize
    where
        F: Fn(&K) -> BtSerialError,
    {
        let drained: Vec<(K, PendingEntry<T>)> = self.entries.lock().await.drain().collect();
        let count = drained.len();
        for (key, entry) in drained {
            entry.complete(Err(make_error(&key)));
        }
        count
    }

    pub async fn contains(&self, key: &K) -> bool {
        self.entries.lock().await.contains_key(key)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

/// Caller-side handle for one registered operation.
///
/// Dropping it abandons interest only; the operation still expires on its
/// own and the registry's expiry hook still runs.
pub struct Completion<K, T> {
    key: K,
    op_id: OperationId,
    rx: oneshot::Receiver<BtSerialResult<T>>,
}

impl<K: fmt::Display, T> Completion<K, T> {
    pub fn operation_id(&self) -> OperationId {
        self.op_id
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    /// Wait for the result, or the timeout error once the operation expires
    pub async fn wait(self) -> BtSerialResult<T> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(BtSerialError::operation_failed(format!(
                "operation for '{}' was cancelled without a result",
                self.key
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeout_err() -> BtSerialError {
        BtSerialError::operation_failed("timed out")
    }

    #[tokio::test]
    async fn test_resolve_delivers_once() {
        let registry: Arc<PendingRegistry<String, u32>> = PendingRegistry::new("test");
        let completion = registry
            .register("a".to_string(), Duration::from_secs(1), timeout_err())
            .await;

        assert!(registry.resolve(&"a".to_string(), 7).await);
        assert!(!registry.resolve(&"a".to_string(), 8).await);
        assert!(!registry.fail(&"a".to_string(), timeout_err()).await);

        assert_eq!(completion.wait().await.unwrap(), 7);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_resolve_unknown_key_is_noop() {
        let registry: Arc<PendingRegistry<String, u32>> = PendingRegistry::new("test");
        assert!(!registry.resolve(&"missing".to_string(), 1).await);
    }

    #[tokio::test]
    async fn test_second_registration_supersedes_first() {
        let registry: Arc<PendingRegistry<String, u32>> = PendingRegistry::new("test");
        let first = registry
            .register("a".to_string(), Duration::from_secs(1), timeout_err())
            .await;
        let second = registry
            .register("a".to_string(), Duration::from_secs(1), timeout_err())
            .await;
        assert_ne!(first.operation_id(), second.operation_id());
        assert_eq!(registry.len().await, 1);

        registry.resolve(&"a".to_string(), 42).await;

        assert!(matches!(
            first.wait().await,
            Err(BtSerialError::Superseded { .. })
        ));
        assert_eq!(second.wait().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_timeout_removes_entry() {
        let registry: Arc<PendingRegistry<String, u32>> = PendingRegistry::new("test");
        let completion = registry
            .register("a".to_string(), Duration::from_millis(10), timeout_err())
            .await;

        let result = completion.wait().await;
        assert!(matches!(result, Err(BtSerialError::OperationFailed { .. })));
        assert!(!registry.contains(&"a".to_string()).await);
    }

    #[tokio::test]
    async fn test_cancel_ignores_newer_operation() {
        let registry: Arc<PendingRegistry<String, u32>> = PendingRegistry::new("test");
        let first = registry
            .register("a".to_string(), Duration::from_secs(1), timeout_err())
            .await;
        let stale_id = first.operation_id();
        let _second = registry
            .register("a".to_string(), Duration::from_secs(1), timeout_err())
            .await;

        assert!(!registry.cancel(&"a".to_string(), stale_id).await);
        assert!(registry.contains(&"a".to_string()).await);
    }

    #[tokio::test]
    async fn test_rekey_moves_operation() {
        let registry: Arc<PendingRegistry<ConnectKey, String>> = PendingRegistry::new("connect");
        let completion = registry
            .register(ConnectKey::FirstAvailable, Duration::from_secs(1), timeout_err())
            .await;

        let target = ConnectKey::Device("AA:BB".to_string());
        assert!(registry.rekey(&ConnectKey::FirstAvailable, target.clone()).await);
        assert!(!registry.contains(&ConnectKey::FirstAvailable).await);

        registry.resolve(&target, "AA:BB".to_string()).await;
        assert_eq!(completion.wait().await.unwrap(), "AA:BB");
    }

    #[tokio::test]
    async fn test_timeout_after_rekey_cleans_up_moved_entry() {
        let registry: Arc<PendingRegistry<ConnectKey, String>> = PendingRegistry::new("connect");
        let completion = registry
            .register(ConnectKey::FirstAvailable, Duration::from_millis(10), timeout_err())
            .await;
        let target = ConnectKey::Device("AA:BB".to_string());
        registry.rekey(&ConnectKey::FirstAvailable, target.clone()).await;

        assert!(completion.wait().await.is_err());
        assert!(!registry.contains(&target).await);
    }

    fn recording_hook(log: Arc<parking_lot::Mutex<Vec<String>>>) -> ExpiryHook<String> {
        Arc::new(move |key: String, message: String| {
            let log = Arc::clone(&log);
            Box::pin(async move {
                log.lock().push(format!("{}: {}", key, message));
            })
        })
    }

    #[tokio::test]
    async fn test_abandoned_operation_still_expires() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let registry: Arc<PendingRegistry<String, u32>> =
            PendingRegistry::with_expiry_hook("test", recording_hook(Arc::clone(&log)));
        let completion = registry
            .register("a".to_string(), Duration::from_millis(10), timeout_err())
            .await;
        drop(completion);

        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(registry.is_empty().await);
        assert_eq!(*log.lock(), vec!["a: Operation failed: timed out".to_string()]);
    }

    #[tokio::test]
    async fn test_expiry_hook_runs_before_waiter_returns() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let registry: Arc<PendingRegistry<String, u32>> =
            PendingRegistry::with_expiry_hook("test", recording_hook(Arc::clone(&log)));
        let completion = registry
            .register("a".to_string(), Duration::from_millis(10), timeout_err())
            .await;

        assert!(completion.wait().await.is_err());
        assert_eq!(log.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_completed_operation_never_expires() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let registry: Arc<PendingRegistry<String, u32>> =
            PendingRegistry::with_expiry_hook("test", recording_hook(Arc::clone(&log)));
        let resolved = registry
            .register("a".to_string(), Duration::from_millis(10), timeout_err())
            .await;
        let cancelled = registry
            .register("b".to_string(), Duration::from_millis(10), timeout_err())
            .await;

        registry.resolve(&"a".to_string(), 1).await;
        assert!(registry.cancel(&"b".to_string(), cancelled.operation_id()).await);
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(resolved.wait().await.unwrap(), 1);
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_expiry_reports_key_after_rekey() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let hook_log = Arc::clone(&log);
        let hook: ExpiryHook<ConnectKey> = Arc::new(move |key: ConnectKey, _message: String| {
            let log = Arc::clone(&hook_log);
            Box::pin(async move {
                log.lock().push(key.to_string());
            })
        });
        let registry: Arc<PendingRegistry<ConnectKey, String>> =
            PendingRegistry::with_expiry_hook("connect", hook);
        let _completion = registry
            .register(ConnectKey::FirstAvailable, Duration::from_millis(10), timeout_err())
            .await;
        registry
            .rekey(&ConnectKey::FirstAvailable, ConnectKey::Device("AA:BB".to_string()))
            .await;

        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(*log.lock(), vec!["AA:BB".to_string()]);
    }

    #[tokio::test]
    async fn test_fail_all() {
        let registry: Arc<PendingRegistry<String, u32>> = PendingRegistry::new("test");
        let a = registry
            .register("a".to_string(), Duration::from_secs(1), timeout_err())
            .await;
        let b = registry
            .register("b".to_string(), Duration::from_secs(1), timeout_err())
            .await;

        let failed = registry
            .fail_all(|key| BtSerialError::connect_failed(&key.to_string(), "shutdown"))
            .await;
        assert_eq!(failed, 2);
        assert!(a.wait().await.is_err());
        assert!(b.wait().await.is_err());
    }

    #[test]
    fn test_connect_key_display() {
        assert_eq!(ConnectKey::Device("AA:BB".into()).to_string(), "AA:BB");
        assert_eq!(ConnectKey::FirstAvailable.to_string(), "<first-available>");
    }
}
