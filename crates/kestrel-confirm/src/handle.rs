//! Caller-owned handles on injected operations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use kestrel_chain::NodeRpc;
use kestrel_core::{KestrelError, OperationHash, Result};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::WatchStream;
use tracing::debug;

use crate::tracker::{ConfirmationState, ConfirmationTracker, TrackerSettings};

/// Told when tracking of a handle ends in failure.
#[async_trait]
pub trait FailureListener: Send + Sync {
    async fn tracking_failed(&self, hash: &str, error: &KestrelError);
}

/// Runs a listener at most once across every clone of a handle.
#[derive(Clone)]
struct OnFailure {
    listener: Arc<dyn FailureListener>,
    fired: Arc<AtomicBool>,
}

impl OnFailure {
    async fn notify(&self, hash: &str, error: &KestrelError) {
        if !self.fired.swap(true, Ordering::AcqRel) {
            self.listener.tracking_failed(hash, error).await;
        }
    }
}

/// An injected operation. Cloning shares the observed state.
#[derive(Clone)]
pub struct OperationHandle {
    hash: OperationHash,
    from_level: u64,
    rpc: Arc<dyn NodeRpc>,
    settings: TrackerSettings,
    observed: Arc<RwLock<ConfirmationState>>,
    on_failure: Option<OnFailure>,
}

impl std::fmt::Debug for OperationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationHandle")
            .field("hash", &self.hash)
            .field("from_level", &self.from_level)
            .finish()
    }
}

impl OperationHandle {
    /// Handle on `hash`, injected when the head was at `from_level`.
    pub fn new(
        hash: impl Into<OperationHash>,
        from_level: u64,
        rpc: Arc<dyn NodeRpc>,
        settings: TrackerSettings,
    ) -> Self {
        Self {
            hash: hash.into(),
            from_level,
            rpc,
            settings,
            observed: Arc::new(RwLock::new(ConfirmationState::Injected)),
            on_failure: None,
        }
    }

    /// Call `listener` the first time a wait on this handle fails.
    pub fn with_listener(mut self, listener: Arc<dyn FailureListener>) -> Self {
        self.on_failure = Some(OnFailure {
            listener,
            fired: Arc::new(AtomicBool::new(false)),
        });
        self
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn settings(&self) -> &TrackerSettings {
        &self.settings
    }

    /// Last state seen by any wait on this handle.
    pub async fn state(&self) -> ConfirmationState {
        self.observed.read().await.clone()
    }

    fn tracker(&self, required: u64) -> ConfirmationTracker {
        ConfirmationTracker::new(self.hash.clone(), self.from_level, required, self.settings)
    }

    /// Poll until the operation has `required` confirmations.
    ///
    /// Fails with `ConfirmationTimeout` or `OperationDropped`. Dropping the
    /// future stops polling.
    pub async fn confirmation(&self, required: u64) -> Result<ConfirmationState> {
        let mut tracker = self.tracker(required);
        let mut interval = tokio::time::interval(self.settings.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            let state = tracker.tick(self.rpc.as_ref()).await;
            *self.observed.write().await = state.clone();
            match state {
                ConfirmationState::Confirmed { .. } => return Ok(state),
                ConfirmationState::Failed(_) => {
                    let error = tracker.error().unwrap_or_else(|| {
                        KestrelError::Internal("failed state without error".to_string())
                    });
                    if let Some(on_failure) = &self.on_failure {
                        on_failure.notify(&self.hash, &error).await;
                    }
                    return Err(error);
                }
                _ => {}
            }
        }
    }

    /// Poll in a background task, publishing every state change.
    pub fn watch(&self, required: u64) -> ConfirmationWatch {
        let (tx, rx) = watch::channel(ConfirmationState::Injected);
        let mut tracker = self.tracker(required);
        let rpc = self.rpc.clone();
        let observed = self.observed.clone();
        let on_failure = self.on_failure.clone();
        let poll_interval = self.settings.poll_interval;

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let state = tracker.tick(rpc.as_ref()).await;
                *observed.write().await = state.clone();
                let terminal = state.is_terminal();
                tx.send_if_modified(|current| {
                    if *current == state {
                        false
                    } else {
                        *current = state;
                        true
                    }
                });
                if terminal || tx.is_closed() {
                    break;
                }
            }
            if let (Some(on_failure), Some(error)) = (&on_failure, tracker.error()) {
                on_failure.notify(tracker.hash(), &error).await;
            }
            debug!(hash = %tracker.hash(), "confirmation watch finished");
        });

        ConfirmationWatch {
            hash: self.hash.clone(),
            receiver: rx,
            task,
        }
    }
}

/// Background confirmation polling. Dropping it stops the poller.
pub struct ConfirmationWatch {
    hash: OperationHash,
    receiver: watch::Receiver<ConfirmationState>,
    task: JoinHandle<()>,
}

impl ConfirmationWatch {
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Most recently published state.
    pub fn current(&self) -> ConfirmationState {
        self.receiver.borrow().clone()
    }

    /// Stream of states, starting with the current one.
    pub fn stream(&self) -> WatchStream<ConfirmationState> {
        WatchStream::new(self.receiver.clone())
    }

    /// Wait for a terminal state.
    pub async fn finished(&self) -> Result<ConfirmationState> {
        let mut states = self.stream();
        while let Some(state) = states.next().await {
            if state.is_terminal() {
                return Ok(state);
            }
        }
        Err(KestrelError::Cancelled(format!(
            "watch on {} ended before a terminal state",
            self.hash
        )))
    }

    /// Stop polling now.
    pub fn cancel(self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for ConfirmationWatch {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::FailureReason;
    use crate::tracker::DEFAULT_LEVELS_PER_TICK;
    use kestrel_chain::{Block, BlockHeader, BlockId, InMemoryNode, ProtocolConstants};
    use kestrel_core::{ContractScript, OperationEnvelope};
    use std::sync::Mutex;
    use std::time::Duration;

    fn settings() -> TrackerSettings {
        TrackerSettings {
            poll_interval: Duration::from_millis(5),
            timeout: Duration::from_millis(40),
            reinclusion_ticks: 3,
            max_transient_failures: 2,
            max_levels_per_tick: DEFAULT_LEVELS_PER_TICK,
        }
    }

    /// A node that accepts connections but never answers a head query.
    struct HungNode(InMemoryNode);

    #[async_trait]
    impl NodeRpc for HungNode {
        async fn head(&self) -> Result<BlockHeader> {
            futures::future::pending().await
        }
        async fn block(&self, id: BlockId) -> Result<Block> {
            self.0.block(id).await
        }
        async fn counter(&self, address: &str) -> Result<u64> {
            self.0.counter(address).await
        }
        async fn manager_key(&self, address: &str) -> Result<Option<String>> {
            self.0.manager_key(address).await
        }
        async fn script(&self, address: &str) -> Result<ContractScript> {
            self.0.script(address).await
        }
        async fn storage(&self, address: &str) -> Result<serde_json::Value> {
            self.0.storage(address).await
        }
        async fn big_map_get(
            &self,
            address: &str,
            key: &serde_json::Value,
            key_type: &serde_json::Value,
        ) -> Result<Option<serde_json::Value>> {
            self.0.big_map_get(address, key, key_type).await
        }
        async fn constants(&self) -> Result<ProtocolConstants> {
            self.0.constants().await
        }
        async fn inject(&self, signed_hex: &str) -> Result<OperationHash> {
            self.0.inject(signed_hex).await
        }
        async fn run_operation(
            &self,
            envelope: &OperationEnvelope,
            signature: &str,
        ) -> Result<serde_json::Value> {
            self.0.run_operation(envelope, signature).await
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    #[async_trait]
    impl FailureListener for Recorder {
        async fn tracking_failed(&self, hash: &str, _error: &KestrelError) {
            self.0.lock().unwrap().push(hash.to_string());
        }
    }

    /// Bake a block every few milliseconds until the returned task is aborted.
    fn baker(node: InMemoryNode) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(3)).await;
                node.bake().await;
            }
        })
    }

    #[tokio::test]
    async fn test_unknown_hash_times_out() {
        let node = InMemoryNode::new();
        let handle = OperationHandle::new("onowhere", 0, Arc::new(node), settings());

        let err = tokio::time::timeout(Duration::from_secs(2), handle.confirmation(1))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, KestrelError::ConfirmationTimeout { ref hash, .. } if hash == "onowhere"));
        assert_eq!(
            handle.state().await,
            ConfirmationState::Failed(FailureReason::Timeout)
        );
    }

    #[tokio::test]
    async fn test_watch_reports_timeout_and_stops() {
        let node = InMemoryNode::new();
        let handle = OperationHandle::new("onowhere", 0, Arc::new(node), settings());
        let watch = handle.watch(1);

        let state = tokio::time::timeout(Duration::from_secs(2), watch.finished())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state, ConfirmationState::Failed(FailureReason::Timeout));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(watch.is_finished());
    }

    #[tokio::test]
    async fn test_cancel_stops_polling() {
        let node = InMemoryNode::new();
        let slow = settings().with_timeout(Duration::from_secs(60));
        let handle = OperationHandle::new("onowhere", 0, Arc::new(node.clone()), slow);
        let bake = baker(node);

        let watch = handle.watch(1);
        let stream = watch.stream();
        watch.cancel();

        // The sender is gone once the task is aborted, so the stream ends.
        let states: Vec<_> = tokio::time::timeout(Duration::from_secs(2), stream.collect::<Vec<_>>())
            .await
            .unwrap();
        assert!(states.iter().all(|s| !s.is_terminal()));
        bake.abort();
    }

    #[tokio::test]
    async fn test_hung_node_times_out() {
        let node = HungNode(InMemoryNode::new());
        let handle = OperationHandle::new("ohung", 0, Arc::new(node), settings());

        let err = tokio::time::timeout(Duration::from_secs(2), handle.confirmation(1))
            .await
            .expect("confirmation must not outlive its timeout")
            .unwrap_err();
        assert!(matches!(err, KestrelError::ConfirmationTimeout { ref hash, .. } if hash == "ohung"));

        let watch = handle.watch(1);
        let state = tokio::time::timeout(Duration::from_secs(2), watch.finished())
            .await
            .expect("watch must not outlive its timeout")
            .unwrap();
        assert_eq!(state, ConfirmationState::Failed(FailureReason::Timeout));
    }

    #[tokio::test]
    async fn test_listener_fires_once() {
        let node = InMemoryNode::new();
        let recorder = Arc::new(Recorder::default());
        let handle = OperationHandle::new("onowhere", 0, Arc::new(node), settings())
            .with_listener(recorder.clone());

        assert!(handle.confirmation(1).await.is_err());
        let watch = handle.clone().watch(1);
        watch.finished().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*recorder.0.lock().unwrap(), vec!["onowhere".to_string()]);
    }

    #[tokio::test]
    async fn test_listener_silent_on_success() {
        let node = InMemoryNode::new();
        let recorder = Arc::new(Recorder::default());
        let (hash, level) = crate::tracker::tests::injected(&node).await;
        let relaxed = settings().with_timeout(Duration::from_secs(2));
        let handle = OperationHandle::new(hash, level, Arc::new(node.clone()), relaxed)
            .with_listener(recorder.clone());
        let bake = baker(node);

        let state = tokio::time::timeout(Duration::from_secs(5), handle.confirmation(1))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(state, ConfirmationState::Confirmed { .. }));
        assert!(recorder.0.lock().unwrap().is_empty());
        bake.abort();
    }

    #[tokio::test]
    async fn test_dropping_confirmation_future_cancels() {
        let node = InMemoryNode::new();
        let slow = settings().with_timeout(Duration::from_secs(60));
        let handle = OperationHandle::new("onowhere", 0, Arc::new(node), slow);

        let waited = tokio::time::timeout(Duration::from_millis(30), handle.confirmation(1)).await;
        assert!(waited.is_err());
        assert_eq!(handle.state().await, ConfirmationState::Injected);
    }
}
