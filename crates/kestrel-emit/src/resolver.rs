//! Counter and branch resolution.
//!
//! A resolution reads the head, the account's on-chain counter and its
//! manager key in parallel, then reserves a contiguous block of counters.
//! Reservations are remembered per account so that a second build issued
//! before the first one lands on chain continues after it instead of reusing
//! the same counters. Reading the reservation, fetching from the node and
//! recording the new reservation happen under the account's lock.
//!
//! A reservation stops counting once its branch is older than the branch
//! validity window, since nothing built on it can be included any more. The
//! next build then starts again from the on-chain counter.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use kestrel_chain::{NodeRpc, MAX_BRANCH_AGE};
use kestrel_core::{Address, BlockHash, KestrelError, Result};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::lock::AccountLock;

/// Branch and counters reserved for one envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub source: Address,
    pub branch: BlockHash,
    pub head_level: u64,
    pub on_chain_counter: u64,
    pub first_counter: u64,
    pub count: u64,
    /// The account needs a reveal; the first reserved counter is for it.
    pub needs_reveal: bool,
    /// Reservation chain the counters belong to. A chain starts whenever
    /// counters are taken from the on-chain value again.
    pub generation: u64,
}

impl Resolution {
    pub fn counters(&self) -> Range<u64> {
        self.first_counter..self.first_counter + self.count
    }

    pub fn last_counter(&self) -> u64 {
        self.first_counter + self.count - 1
    }
}

#[derive(Debug, Clone, Copy)]
struct Reservation {
    high_water: u64,
    reveal_pending: bool,
    /// Head level of the newest envelope holding reserved counters.
    reserved_at: u64,
    generation: u64,
}

/// Resolves branches and hands out counters.
pub struct CounterResolver {
    rpc: Arc<dyn NodeRpc>,
    lock: Arc<dyn AccountLock>,
    reservations: Mutex<HashMap<Address, Reservation>>,
    max_age: u64,
    generations: AtomicU64,
}

impl CounterResolver {
    pub fn new(rpc: Arc<dyn NodeRpc>, lock: Arc<dyn AccountLock>) -> Self {
        Self {
            rpc,
            lock,
            reservations: Mutex::new(HashMap::new()),
            max_age: MAX_BRANCH_AGE,
            generations: AtomicU64::new(0),
        }
    }

    /// Levels after which a reservation no longer holds counters back.
    pub fn with_max_age(mut self, levels: u64) -> Self {
        self.max_age = levels;
        self
    }

    /// Accounts with counters currently reserved.
    pub async fn reserved_accounts(&self) -> usize {
        self.reservations.lock().await.len()
    }

    /// Current branch and head level, for envelopes without counters.
    pub async fn branch(&self) -> Result<(BlockHash, u64)> {
        let head = self.rpc.head().await?;
        Ok((head.hash, head.level))
    }

    /// Reserve counters for `manager_count` contents from `source`, plus
    /// one for a reveal when the account is not yet revealed.
    pub async fn resolve(&self, source: &str, manager_count: u64) -> Result<Resolution> {
        let _guard = self.lock.acquire(source).await;

        let (head, on_chain_counter, manager_key) = futures::try_join!(
            self.rpc.head(),
            self.rpc.counter(source),
            self.rpc.manager_key(source),
        )?;

        let reserved = {
            let mut reservations = self.reservations.lock().await;
            self.expire(&mut reservations, head.level);
            reservations.get(source).copied()
        };

        // A reservation at or below the on-chain counter has landed (or was
        // abandoned) and no longer constrains anything.
        let live = reserved.filter(|r| r.high_water > on_chain_counter);
        let base = live.map_or(on_chain_counter, |r| r.high_water);
        let revealed = manager_key.is_some() || live.is_some_and(|r| r.reveal_pending);
        let needs_reveal = !revealed;
        let count = manager_count + u64::from(needs_reveal);

        let exhausted = || KestrelError::Validation(format!("counters of {source} are exhausted"));
        let first_counter = base.checked_add(1).ok_or_else(exhausted)?;
        // Exclusive end of the block, so `counters()` cannot wrap either.
        let end = first_counter.checked_add(count).ok_or_else(exhausted)?;
        let high_water = end - 1;
        let generation = live.map_or_else(
            || self.generations.fetch_add(1, Ordering::Relaxed),
            |r| r.generation,
        );

        let resolution = Resolution {
            source: source.to_string(),
            branch: head.hash,
            head_level: head.level,
            on_chain_counter,
            first_counter,
            count,
            needs_reveal,
            generation,
        };

        self.reservations.lock().await.insert(
            source.to_string(),
            Reservation {
                high_water,
                reveal_pending: needs_reveal || live.is_some_and(|r| r.reveal_pending),
                reserved_at: head.level,
                generation,
            },
        );

        debug!(
            source,
            branch = %resolution.branch,
            on_chain_counter,
            first = resolution.first_counter,
            count,
            needs_reveal,
            "resolved counters"
        );

        Ok(resolution)
    }

    /// Drop reservations whose branch has left the validity window.
    fn expire(&self, reservations: &mut HashMap<Address, Reservation>, head_level: u64) {
        reservations.retain(|source, r| {
            let live = head_level <= r.reserved_at.saturating_add(self.max_age);
            if !live {
                debug!(source = %source, reserved_at = r.reserved_at, head_level, "reservation expired");
            }
            live
        });
    }

    /// Forget every counter reserved for `source`. The next resolution starts
    /// from the on-chain counter.
    pub async fn reset(&self, source: &str) {
        let _guard = self.lock.acquire(source).await;
        if self.reservations.lock().await.remove(source).is_some() {
            debug!(source, "reservation reset");
        }
    }

    /// Forget the reservation holding the counters of an operation that will
    /// never land. Counters reserved after it in the same chain cannot land
    /// either and go with it. A reservation started since (after a reset or
    /// an expiry) is left alone.
    pub async fn abandon(&self, resolution: &Resolution) {
        let source = resolution.source.as_str();
        let _guard = self.lock.acquire(source).await;
        let mut reservations = self.reservations.lock().await;
        if reservations.get(source).is_some_and(|r| {
            r.generation == resolution.generation && r.high_water >= resolution.first_counter
        }) {
            reservations.remove(source);
            warn!(
                source,
                first_counter = resolution.first_counter,
                "counters of a failed operation abandoned"
            );
        }
    }

    /// Give back the counters of an envelope that was not injected.
    ///
    /// Only the newest reservation can be given back; an older one is left
    /// in place until it expires or is abandoned.
    pub async fn release(&self, resolution: &Resolution) {
        let _guard = self.lock.acquire(&resolution.source).await;
        let mut reservations = self.reservations.lock().await;
        let Some(reservation) = reservations.get_mut(&resolution.source) else {
            return;
        };

        if reservation.high_water != resolution.last_counter() {
            warn!(
                source = %resolution.source,
                released = resolution.last_counter(),
                high_water = reservation.high_water,
                "cannot release counters below a newer reservation"
            );
            return;
        }

        reservation.high_water = resolution.first_counter - 1;
        if resolution.needs_reveal {
            reservation.reveal_pending = false;
        }
        if reservation.high_water <= resolution.on_chain_counter {
            reservations.remove(&resolution.source);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{PerAccountLock, Unserialized};
    use async_trait::async_trait;
    use kestrel_chain::{Block, BlockHeader, BlockId, InMemoryNode, ProtocolConstants};
    use kestrel_core::{ContractScript, OperationEnvelope, OperationHash};
    use serde_json::Value;
    use tokio::sync::Barrier;

    const SOURCE: &str = "tz1source";

    async fn node_at(counter: u64, revealed: bool) -> InMemoryNode {
        let node = InMemoryNode::new();
        node.set_counter(SOURCE, counter).await;
        if revealed {
            // Any valid key marks the account revealed for resolution.
            let signer = kestrel_chain::Ed25519Signer::from_seed([9; 32]);
            let pk = signer.encoded_public_key();
            let pkh = node.reveal_key(&pk).await.unwrap();
            node.set_counter(&pkh, counter).await;
        }
        node
    }

    #[tokio::test]
    async fn test_unrevealed_account_reserves_reveal_counter() {
        let node = node_at(41, false).await;
        let resolver = CounterResolver::new(Arc::new(node), Arc::new(PerAccountLock::new()));

        let res = resolver.resolve(SOURCE, 1).await.unwrap();
        assert!(res.needs_reveal);
        assert_eq!(res.counters(), 42..44);
        assert_eq!(res.on_chain_counter, 41);
    }

    #[tokio::test]
    async fn test_revealed_account() {
        let node = node_at(7, true).await;
        let address = kestrel_chain::Ed25519Signer::from_seed([9; 32]).address();
        let resolver = CounterResolver::new(Arc::new(node), Arc::new(PerAccountLock::new()));

        let res = resolver.resolve(&address, 3).await.unwrap();
        assert!(!res.needs_reveal);
        assert_eq!(res.counters(), 8..11);
    }

    #[tokio::test]
    async fn test_second_resolution_continues_after_first() {
        let node = node_at(41, false).await;
        let resolver = CounterResolver::new(Arc::new(node), Arc::new(PerAccountLock::new()));

        let first = resolver.resolve(SOURCE, 1).await.unwrap();
        let second = resolver.resolve(SOURCE, 1).await.unwrap();
        assert_eq!(first.counters(), 42..44);
        // The pending reveal from the first envelope covers the second.
        assert!(!second.needs_reveal);
        assert_eq!(second.counters(), 44..45);
    }

    #[tokio::test]
    async fn test_release_newest_reservation() {
        let node = node_at(10, false).await;
        let resolver = CounterResolver::new(Arc::new(node), Arc::new(PerAccountLock::new()));

        let first = resolver.resolve(SOURCE, 1).await.unwrap();
        resolver.release(&first).await;
        let retry = resolver.resolve(SOURCE, 1).await.unwrap();
        assert_eq!(retry.counters(), first.counters());
        assert!(retry.needs_reveal);
    }

    #[tokio::test]
    async fn test_release_older_reservation_is_kept() {
        let node = node_at(10, false).await;
        let resolver = CounterResolver::new(Arc::new(node), Arc::new(PerAccountLock::new()));

        let first = resolver.resolve(SOURCE, 1).await.unwrap();
        let second = resolver.resolve(SOURCE, 1).await.unwrap();
        resolver.release(&first).await;
        let third = resolver.resolve(SOURCE, 1).await.unwrap();
        assert_eq!(third.first_counter, second.last_counter() + 1);
    }

    #[tokio::test]
    async fn test_reservation_expires_with_its_branch() {
        let node = node_at(41, false).await;
        let resolver = CounterResolver::new(Arc::new(node.clone()), Arc::new(PerAccountLock::new()));

        // Reserved but never landed on chain.
        let lost = resolver.resolve(SOURCE, 1).await.unwrap();
        assert_eq!(lost.counters(), 42..44);

        node.bake_n(MAX_BRANCH_AGE).await;
        let pending = resolver.resolve(SOURCE, 1).await.unwrap();
        assert_eq!(pending.first_counter, 44);

        node.bake_n(MAX_BRANCH_AGE + 1).await;
        let fresh = resolver.resolve(SOURCE, 1).await.unwrap();
        assert!(fresh.needs_reveal);
        assert_eq!(fresh.counters(), 42..44);
    }

    #[tokio::test]
    async fn test_expired_reservations_are_pruned() {
        let node = node_at(0, false).await;
        let resolver = CounterResolver::new(Arc::new(node.clone()), Arc::new(PerAccountLock::new()))
            .with_max_age(2);
        for i in 0..5 {
            resolver.resolve(&format!("tz1other{i}"), 1).await.unwrap();
        }
        assert_eq!(resolver.reserved_accounts().await, 5);

        node.bake_n(3).await;
        resolver.resolve(SOURCE, 1).await.unwrap();
        assert_eq!(resolver.reserved_accounts().await, 1);
    }

    #[tokio::test]
    async fn test_reset_and_abandon() {
        let node = node_at(41, false).await;
        let resolver = CounterResolver::new(Arc::new(node), Arc::new(PerAccountLock::new()));

        let first = resolver.resolve(SOURCE, 1).await.unwrap();
        resolver.reset(SOURCE).await;
        let again = resolver.resolve(SOURCE, 1).await.unwrap();
        assert_eq!(again.counters(), first.counters());
        assert_ne!(again.generation, first.generation);

        // A failure from before the reset leaves the new chain alone.
        resolver.abandon(&first).await;
        let next = resolver.resolve(SOURCE, 1).await.unwrap();
        assert_eq!(next.first_counter, again.last_counter() + 1);
        assert_eq!(next.generation, again.generation);

        // Abandoning an earlier link takes the later ones with it.
        resolver.abandon(&again).await;
        let rebuilt = resolver.resolve(SOURCE, 1).await.unwrap();
        assert!(rebuilt.needs_reveal);
        assert_eq!(rebuilt.counters(), 42..44);
    }

    #[tokio::test]
    async fn test_exhausted_counter_is_validation() {
        let node = node_at(u64::MAX, false).await;
        let resolver = CounterResolver::new(Arc::new(node), Arc::new(PerAccountLock::new()));
        let err = resolver.resolve(SOURCE, 1).await.unwrap_err();
        assert!(matches!(err, KestrelError::Validation(_)));
    }

    #[tokio::test]
    async fn test_landed_reservation_is_superseded() {
        let node = node_at(10, false).await;
        let resolver = CounterResolver::new(Arc::new(node.clone()), Arc::new(PerAccountLock::new()));

        let first = resolver.resolve(SOURCE, 2).await.unwrap();
        node.set_counter(SOURCE, 20).await;
        let second = resolver.resolve(SOURCE, 1).await.unwrap();
        assert_eq!(first.last_counter(), 13);
        assert_eq!(second.first_counter, 21);
    }

    /// Node whose counter read waits until two readers are inside it.
    struct RacingNode {
        inner: InMemoryNode,
        barrier: Barrier,
    }

    #[async_trait]
    impl NodeRpc for RacingNode {
        async fn head(&self) -> Result<BlockHeader> {
            self.inner.head().await
        }
        async fn block(&self, id: BlockId) -> Result<Block> {
            self.inner.block(id).await
        }
        async fn counter(&self, address: &str) -> Result<u64> {
            self.barrier.wait().await;
            self.inner.counter(address).await
        }
        async fn manager_key(&self, address: &str) -> Result<Option<String>> {
            self.inner.manager_key(address).await
        }
        async fn script(&self, address: &str) -> Result<ContractScript> {
            self.inner.script(address).await
        }
        async fn storage(&self, address: &str) -> Result<Value> {
            self.inner.storage(address).await
        }
        async fn big_map_get(&self, address: &str, key: &Value, ty: &Value) -> Result<Option<Value>> {
            self.inner.big_map_get(address, key, ty).await
        }
        async fn constants(&self) -> Result<ProtocolConstants> {
            self.inner.constants().await
        }
        async fn inject(&self, signed_hex: &str) -> Result<OperationHash> {
            self.inner.inject(signed_hex).await
        }
        async fn run_operation(&self, envelope: &OperationEnvelope, signature: &str) -> Result<Value> {
            self.inner.run_operation(envelope, signature).await
        }
    }

    #[tokio::test]
    async fn test_unserialized_resolution_collides() {
        let node = RacingNode {
            inner: node_at(41, false).await,
            barrier: Barrier::new(2),
        };
        let resolver = CounterResolver::new(Arc::new(node), Arc::new(Unserialized));

        let (a, b) = tokio::join!(resolver.resolve(SOURCE, 1), resolver.resolve(SOURCE, 1));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.first_counter, b.first_counter);
        assert_eq!(a.counters(), 42..44);
    }

    #[tokio::test]
    async fn test_serialized_resolution_never_collides() {
        let node = node_at(41, false).await;
        let resolver = Arc::new(CounterResolver::new(
            Arc::new(node),
            Arc::new(PerAccountLock::new()),
        ));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let resolver = resolver.clone();
                tokio::spawn(async move { resolver.resolve(SOURCE, 1).await.unwrap() })
            })
            .collect();

        let mut counters = Vec::new();
        for task in tasks {
            counters.extend(task.await.unwrap().counters());
        }
        counters.sort_unstable();
        let expected: Vec<u64> = (42..42 + counters.len() as u64).collect();
        assert_eq!(counters, expected);
    }
}
