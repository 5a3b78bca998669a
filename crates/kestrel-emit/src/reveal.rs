//! Reveal injection.

use kestrel_core::{FeePolicy, OperationContent, OperationKind, Reveal};

use crate::resolver::Resolution;

/// Prepends a reveal for accounts whose key is not yet on chain.
#[derive(Debug, Clone, Default)]
pub struct RevealInjector {
    policy: FeePolicy,
}

impl RevealInjector {
    pub fn new(policy: FeePolicy) -> Self {
        Self { policy }
    }

    /// Return `contents` with a reveal in front when the resolution says the
    /// account is unrevealed. The reveal carries the first reserved counter.
    pub fn ensure_revealed(
        &self,
        resolution: &Resolution,
        public_key: &str,
        contents: Vec<OperationContent>,
    ) -> Vec<OperationContent> {
        if !resolution.needs_reveal || contents.iter().any(OperationContent::is_reveal) {
            return contents;
        }

        let limits = self.policy.defaults(OperationKind::Reveal);
        let reveal = OperationContent::Reveal(Reveal {
            source: resolution.source.clone(),
            fee: limits.fee,
            counter: resolution.first_counter,
            gas_limit: limits.gas_limit,
            storage_limit: limits.storage_limit,
            public_key: public_key.to_string(),
        });

        let mut out = Vec::with_capacity(contents.len() + 1);
        out.push(reveal);
        out.extend(contents);
        out
    }
}
