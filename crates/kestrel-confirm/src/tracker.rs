//! Confirmation state machine.
//!
//! A [`ConfirmationTracker`] never sleeps. Each call to
//! [`ConfirmationTracker::tick`] reads the chain once and advances the state,
//! so the driver decides how ticks are spaced and tests can step it directly.
//! A tick that the node does not answer within the remaining timeout ends
//! tracking, and one tick reads at most `max_levels_per_tick` blocks.

use std::time::Duration;

use kestrel_chain::{BlockId, NodeRpc};
use kestrel_core::{BlockHash, ClientConfig, KestrelError, OperationHash, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Why tracking ended without confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    /// Never seen in a block, or the chain stopped advancing.
    Timeout,
    /// Included at `level`, then gone after a reorg.
    Dropped { level: u64 },
}

/// Lifecycle of an injected operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConfirmationState {
    Injected,
    Included {
        level: u64,
        block_hash: BlockHash,
    },
    Confirmed {
        level: u64,
        block_hash: BlockHash,
        confirmations: u64,
    },
    Failed(FailureReason),
}

impl ConfirmationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConfirmationState::Confirmed { .. } | ConfirmationState::Failed(_)
        )
    }

    /// Inclusion level, if the operation has been seen in a block.
    pub fn level(&self) -> Option<u64> {
        match self {
            ConfirmationState::Included { level, .. }
            | ConfirmationState::Confirmed { level, .. } => Some(*level),
            _ => None,
        }
    }
}

/// Blocks read per tick while catching up with the head.
pub const DEFAULT_LEVELS_PER_TICK: u64 = 32;

/// Polling limits for one tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerSettings {
    pub poll_interval: Duration,
    pub timeout: Duration,
    pub reinclusion_ticks: u32,
    pub max_transient_failures: u32,
    pub max_levels_per_tick: u64,
}

impl TrackerSettings {
    /// Ticks that fit in the timeout, rounded up.
    pub fn tick_budget(&self) -> u64 {
        let interval = self.poll_interval.as_millis().max(1);
        let ticks = self.timeout.as_millis().div_ceil(interval);
        u64::try_from(ticks).unwrap_or(u64::MAX).max(1)
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_levels_per_tick(mut self, levels: u64) -> Self {
        self.max_levels_per_tick = levels.max(1);
        self
    }
}

impl From<&ClientConfig> for TrackerSettings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            timeout: config.confirmation_timeout(),
            reinclusion_ticks: config.reinclusion_ticks,
            max_transient_failures: config.max_transient_failures,
            max_levels_per_tick: DEFAULT_LEVELS_PER_TICK,
        }
    }
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

#[derive(Debug, Clone, Copy)]
struct Reinclusion {
    dropped_level: u64,
    ticks: u32,
}

/// Outcome of one bounded search pass.
enum Scan {
    Found(u64, BlockHash),
    /// Levels up to the head remain unread.
    Behind,
    CaughtUp,
}

/// Tracks one operation hash towards `required` confirmations.
#[derive(Debug, Clone)]
pub struct ConfirmationTracker {
    hash: OperationHash,
    required: u64,
    settings: TrackerSettings,
    state: ConfirmationState,
    /// Next level not yet searched.
    scan_from: u64,
    /// Ticks without progress: unseen, or head not advancing after inclusion.
    idle_ticks: u64,
    last_head: u64,
    transient_failures: u32,
    reinclusion: Option<Reinclusion>,
    /// Level of the block holding the operation while it is included.
    included_at: Option<u64>,
}

impl ConfirmationTracker {
    /// Track `hash`, searching for it from `from_level` upwards.
    pub fn new(
        hash: impl Into<OperationHash>,
        from_level: u64,
        required: u64,
        settings: TrackerSettings,
    ) -> Self {
        Self {
            hash: hash.into(),
            required,
            settings,
            state: ConfirmationState::Injected,
            scan_from: from_level,
            idle_ticks: 0,
            last_head: from_level,
            transient_failures: 0,
            reinclusion: None,
            included_at: None,
        }
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn state(&self) -> &ConfirmationState {
        &self.state
    }

    pub fn required(&self) -> u64 {
        self.required
    }

    /// Time spent polling so far, counted in intervals.
    pub fn waited(&self) -> Duration {
        self.settings.poll_interval * u32::try_from(self.idle_ticks).unwrap_or(u32::MAX)
    }

    /// Poll the chain once and advance.
    pub async fn tick(&mut self, rpc: &dyn NodeRpc) -> ConfirmationState {
        if self.state.is_terminal() {
            return self.state.clone();
        }

        let remaining = self.remaining();
        match tokio::time::timeout(remaining, self.poll(rpc)).await {
            Ok(Ok(())) => self.transient_failures = 0,
            Ok(Err(e)) => {
                self.transient_failures += 1;
                warn!(
                    hash = %self.hash,
                    error = %e,
                    failures = self.transient_failures,
                    "confirmation poll failed"
                );
                if self.transient_failures > self.settings.max_transient_failures {
                    self.fail(FailureReason::Timeout);
                }
            }
            Err(_) => {
                warn!(hash = %self.hash, ?remaining, "node did not answer before the timeout");
                self.idle_ticks = self.idle_ticks.max(self.settings.tick_budget());
                self.fail(FailureReason::Timeout);
            }
        }
        self.state.clone()
    }

    /// Wall-clock time left in the idle budget.
    fn remaining(&self) -> Duration {
        self.settings
            .timeout
            .saturating_sub(self.waited())
            .max(Duration::from_millis(1))
    }

    async fn poll(&mut self, rpc: &dyn NodeRpc) -> Result<()> {
        let head = rpc.head().await?;
        let advanced = head.level > self.last_head;
        self.last_head = self.last_head.max(head.level);

        if let ConfirmationState::Included { level, block_hash } = self.state.clone() {
            let block = match rpc.block(BlockId::Level(level)).await {
                Ok(block) => Some(block),
                // The chain is now shorter than the inclusion level.
                Err(KestrelError::NotFound { .. }) => None,
                Err(e) => return Err(e),
            };
            let still_there = block
                .as_ref()
                .is_some_and(|b| b.hash() == block_hash && b.contains(&self.hash));
            if still_there {
                if advanced {
                    self.idle_ticks = 0;
                } else {
                    self.idle_ticks += 1;
                }
                self.settle(level, block_hash, head.level);
                if !self.state.is_terminal() && self.idle_ticks >= self.settings.tick_budget() {
                    self.fail(FailureReason::Timeout);
                }
                return Ok(());
            }

            warn!(hash = %self.hash, level, "inclusion block replaced, searching again");
            self.state = ConfirmationState::Injected;
            self.included_at = None;
            self.scan_from = level;
            self.reinclusion = Some(Reinclusion {
                dropped_level: level,
                ticks: 0,
            });
        }

        match self.search(rpc, head.level).await? {
            Scan::Found(level, block_hash) => {
                info!(hash = %self.hash, level, "operation included");
                self.reinclusion = None;
                self.idle_ticks = 0;
                self.settle(level, block_hash, head.level);
                return Ok(());
            }
            // Reading old blocks is progress; the budget counts idle ticks only.
            Scan::Behind => {
                debug!(hash = %self.hash, next = self.scan_from, head = head.level, "catching up with the head");
                return Ok(());
            }
            Scan::CaughtUp => {}
        }

        if let Some(reinclusion) = self.reinclusion.as_mut() {
            reinclusion.ticks += 1;
            if reinclusion.ticks >= self.settings.reinclusion_ticks {
                let level = reinclusion.dropped_level;
                self.fail(FailureReason::Dropped { level });
            }
            return Ok(());
        }

        self.idle_ticks += 1;
        if self.idle_ticks >= self.settings.tick_budget() {
            self.fail(FailureReason::Timeout);
        }
        Ok(())
    }

    /// Look for the hash in unscanned levels up to the head, reading at most
    /// `max_levels_per_tick` blocks.
    async fn search(&mut self, rpc: &dyn NodeRpc, head_level: u64) -> Result<Scan> {
        let window = self.settings.max_levels_per_tick.max(1);
        let last = head_level.min(self.scan_from.saturating_add(window - 1));
        while self.scan_from <= last {
            let block = rpc.block(BlockId::Level(self.scan_from)).await?;
            self.scan_from += 1;
            if block.contains(&self.hash) {
                return Ok(Scan::Found(block.level(), block.header.hash));
            }
        }
        if self.scan_from <= head_level {
            Ok(Scan::Behind)
        } else {
            Ok(Scan::CaughtUp)
        }
    }

    fn settle(&mut self, level: u64, block_hash: BlockHash, head_level: u64) {
        self.included_at = Some(level);
        let confirmations = head_level.saturating_sub(level);
        self.state = if confirmations >= self.required {
            info!(hash = %self.hash, level, confirmations, "operation confirmed");
            ConfirmationState::Confirmed {
                level,
                block_hash,
                confirmations,
            }
        } else {
            debug!(hash = %self.hash, level, confirmations, required = self.required, "waiting for confirmations");
            ConfirmationState::Included { level, block_hash }
        };
    }

    fn fail(&mut self, reason: FailureReason) {
        warn!(hash = %self.hash, ?reason, "tracking failed");
        self.state = ConfirmationState::Failed(reason);
    }

    /// Error for a failed state, `None` otherwise.
    pub fn error(&self) -> Option<KestrelError> {
        match self.state {
            ConfirmationState::Failed(FailureReason::Timeout) => Some(KestrelError::ConfirmationTimeout {
                hash: self.hash.clone(),
                waited_ms: u64::try_from(self.waited().as_millis()).unwrap_or(u64::MAX),
                included_at: self.included_at,
            }),
            ConfirmationState::Failed(FailureReason::Dropped { level }) => {
                Some(KestrelError::OperationDropped {
                    hash: self.hash.clone(),
                    level,
                })
            }
            _ => None,
        }
    }
}
