//! Operation builder.
//!
//! Public operations are first converted to drafts (amounts parsed, code and
//! parameters converted) so malformed input fails before any network call.
//! Drafts are then bound to a source, a branch and a counter block, with a
//! reveal prepended when needed.

use std::sync::Arc;

use kestrel_chain::{Codec, Signer};
use kestrel_core::{
    Activation, Address, ContractScript, Delegation, FeePolicy, KestrelError, LimitOverrides,
    Mutez, OperationContent, OperationEnvelope, OperationKind, Origination, Result, Transaction,
};
use serde_json::Value;
use tracing::info;

use crate::resolver::{CounterResolver, Resolution};
use crate::reveal::RevealInjector;

/// Contract code or a value, either in wire form or as text for the codec.
#[derive(Debug, Clone, PartialEq)]
pub enum Michelson {
    Json(Value),
    Text(String),
}

impl From<Value> for Michelson {
    fn from(value: Value) -> Self {
        Michelson::Json(value)
    }
}

impl From<&str> for Michelson {
    fn from(text: &str) -> Self {
        Michelson::Text(text.to_string())
    }
}

impl From<String> for Michelson {
    fn from(text: String) -> Self {
        Michelson::Text(text)
    }
}

/// Parameters of a transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferParams {
    pub to: Address,
    /// Defaults to the signer's address.
    pub source: Option<Address>,
    /// Tez decimal text, or mutez integer text when `mutez` is set.
    pub amount: String,
    pub mutez: bool,
    pub parameter: Option<String>,
    /// Pass `parameter` through as wire JSON instead of converting it.
    pub raw_param: bool,
    pub limits: LimitOverrides,
}

impl TransferParams {
    pub fn new(to: impl Into<Address>, amount: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            source: None,
            amount: amount.into(),
            mutez: false,
            parameter: None,
            raw_param: false,
            limits: LimitOverrides::default(),
        }
    }

    pub fn source(mut self, source: impl Into<Address>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Interpret the amount as mutez.
    pub fn mutez(mut self) -> Self {
        self.mutez = true;
        self
    }

    pub fn parameter(mut self, text: impl Into<String>) -> Self {
        self.parameter = Some(text.into());
        self.raw_param = false;
        self
    }

    pub fn raw_parameter(mut self, json: impl Into<String>) -> Self {
        self.parameter = Some(json.into());
        self.raw_param = true;
        self
    }

    pub fn limits(mut self, limits: LimitOverrides) -> Self {
        self.limits = limits;
        self
    }
}

/// Parameters of a contract origination.
#[derive(Debug, Clone, PartialEq)]
pub struct OriginateParams {
    pub code: Michelson,
    pub init: Michelson,
    /// Tez decimal text.
    pub balance: String,
    pub spendable: bool,
    pub delegatable: bool,
    pub delegate: Option<Address>,
    pub limits: LimitOverrides,
}

impl OriginateParams {
    pub fn new(code: impl Into<Michelson>, init: impl Into<Michelson>) -> Self {
        Self {
            code: code.into(),
            init: init.into(),
            balance: "0".to_string(),
            spendable: false,
            delegatable: false,
            delegate: None,
            limits: LimitOverrides::default(),
        }
    }

    pub fn balance(mut self, tez: impl Into<String>) -> Self {
        self.balance = tez.into();
        self
    }

    pub fn spendable(mut self, spendable: bool) -> Self {
        self.spendable = spendable;
        self
    }

    pub fn delegatable(mut self, delegatable: bool) -> Self {
        self.delegatable = delegatable;
        self
    }

    pub fn delegate(mut self, delegate: impl Into<Address>) -> Self {
        self.delegate = Some(delegate.into());
        self
    }

    pub fn limits(mut self, limits: LimitOverrides) -> Self {
        self.limits = limits;
        self
    }
}

/// Parameters of a delegation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DelegationParams {
    /// `None` withdraws the current delegate.
    pub delegate: Option<Address>,
    /// Defaults to the signer's address.
    pub source: Option<Address>,
    pub limits: LimitOverrides,
}

impl DelegationParams {
    pub fn new(delegate: impl Into<Address>) -> Self {
        Self {
            delegate: Some(delegate.into()),
            ..Default::default()
        }
    }

    pub fn withdraw() -> Self {
        Self::default()
    }

    pub fn source(mut self, source: impl Into<Address>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn limits(mut self, limits: LimitOverrides) -> Self {
        self.limits = limits;
        self
    }
}

/// One manager operation of a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationParams {
    Transfer(TransferParams),
    Originate(OriginateParams),
    Delegation(DelegationParams),
}

/// Manager content without source or counter.
#[derive(Debug, Clone, PartialEq)]
pub enum Draft {
    Transaction {
        destination: Address,
        amount: Mutez,
        parameters: Option<Value>,
        limits: LimitOverrides,
    },
    Origination {
        script: ContractScript,
        balance: Mutez,
        spendable: bool,
        delegatable: bool,
        delegate: Option<Address>,
        limits: LimitOverrides,
    },
    Delegation {
        delegate: Option<Address>,
        limits: LimitOverrides,
    },
}

impl Draft {
    pub fn kind(&self) -> OperationKind {
        match self {
            Draft::Transaction { .. } => OperationKind::Transaction,
            Draft::Origination { .. } => OperationKind::Origination,
            Draft::Delegation { .. } => OperationKind::Delegation,
        }
    }

    /// Content record for `source`, counter still unassigned.
    pub fn into_content(self, source: &str, policy: &FeePolicy) -> OperationContent {
        let kind = self.kind();
        match self {
            Draft::Transaction {
                destination,
                amount,
                parameters,
                limits,
            } => {
                let limits = policy.limits(kind, &limits);
                OperationContent::Transaction(Transaction {
                    source: source.to_string(),
                    fee: limits.fee,
                    counter: 0,
                    gas_limit: limits.gas_limit,
                    storage_limit: limits.storage_limit,
                    amount,
                    destination,
                    parameters,
                })
            }
            Draft::Origination {
                script,
                balance,
                spendable,
                delegatable,
                delegate,
                limits,
            } => {
                let limits = policy.limits(kind, &limits);
                OperationContent::Origination(Origination {
                    source: source.to_string(),
                    fee: limits.fee,
                    counter: 0,
                    gas_limit: limits.gas_limit,
                    storage_limit: limits.storage_limit,
                    manager_pubkey: source.to_string(),
                    balance,
                    spendable,
                    delegatable,
                    delegate,
                    script,
                })
            }
            Draft::Delegation { delegate, limits } => {
                let limits = policy.limits(kind, &limits);
                OperationContent::Delegation(Delegation {
                    source: source.to_string(),
                    fee: limits.fee,
                    counter: 0,
                    gas_limit: limits.gas_limit,
                    storage_limit: limits.storage_limit,
                    delegate,
                })
            }
        }
    }
}

/// An envelope ready for the pipeline, with the counters it holds.
#[derive(Debug, Clone)]
pub struct Built {
    pub envelope: OperationEnvelope,
    /// `None` for envelopes without manager contents.
    pub resolution: Option<Resolution>,
    pub head_level: u64,
}

/// Composes envelopes from public operation parameters.
pub struct OperationBuilder {
    resolver: Arc<CounterResolver>,
    signer: Arc<dyn Signer>,
    codec: Arc<dyn Codec>,
    policy: FeePolicy,
    injector: RevealInjector,
}

impl OperationBuilder {
    pub fn new(
        resolver: Arc<CounterResolver>,
        signer: Arc<dyn Signer>,
        codec: Arc<dyn Codec>,
        policy: FeePolicy,
    ) -> Self {
        Self {
            resolver,
            signer,
            codec,
            injector: RevealInjector::new(policy.clone()),
            policy,
        }
    }

    pub fn policy(&self) -> &FeePolicy {
        &self.policy
    }

    fn convert(&self, input: &Michelson, what: &str, code: bool) -> Result<Value> {
        match input {
            Michelson::Json(value) => Ok(value.clone()),
            Michelson::Text(text) if code => self.codec.code_from_text(text),
            Michelson::Text(text) => self.codec.value_from_text(text),
        }
        .map_err(|e| match e {
            KestrelError::Validation(msg) => KestrelError::Validation(format!("{what}: {msg}")),
            other => other,
        })
    }

    pub fn transfer_draft(&self, params: &TransferParams) -> Result<(Option<Address>, Draft)> {
        if params.to.is_empty() {
            return Err(KestrelError::Validation("transfer destination is empty".to_string()));
        }
        let amount = Mutez::parse(&params.amount, params.mutez)?;
        let parameters = match &params.parameter {
            None => None,
            Some(raw) if params.raw_param => Some(serde_json::from_str(raw).map_err(|e| {
                KestrelError::Validation(format!("raw parameter is not JSON: {e}"))
            })?),
            Some(text) => Some(self.convert(&Michelson::Text(text.clone()), "parameter", false)?),
        };
        Ok((
            params.source.clone(),
            Draft::Transaction {
                destination: params.to.clone(),
                amount,
                parameters,
                limits: params.limits,
            },
        ))
    }

    pub fn originate_draft(&self, params: &OriginateParams) -> Result<Draft> {
        let code = self.convert(&params.code, "code", true)?;
        let storage = self.convert(&params.init, "init", false)?;
        let balance = Mutez::from_tez(&params.balance)?;
        Ok(Draft::Origination {
            script: ContractScript { code, storage },
            balance,
            spendable: params.spendable,
            delegatable: params.delegatable,
            delegate: params.delegate.clone(),
            limits: params.limits,
        })
    }

    pub fn delegation_draft(&self, params: &DelegationParams) -> (Option<Address>, Draft) {
        (
            params.source.clone(),
            Draft::Delegation {
                delegate: params.delegate.clone(),
                limits: params.limits,
            },
        )
    }

    pub async fn transfer(&self, params: &TransferParams) -> Result<Built> {
        let (source, draft) = self.transfer_draft(params)?;
        self.build(source, vec![draft]).await
    }

    pub async fn originate(&self, params: &OriginateParams) -> Result<Built> {
        let draft = self.originate_draft(params)?;
        self.build(None, vec![draft]).await
    }

    pub async fn set_delegate(&self, params: &DelegationParams) -> Result<Built> {
        let (source, draft) = self.delegation_draft(params);
        self.build(source, vec![draft]).await
    }

    /// Delegate the signer's account to itself.
    pub async fn register_delegate(&self, limits: LimitOverrides) -> Result<Built> {
        let own = self.signer.public_key_hash().await?;
        let params = DelegationParams {
            delegate: Some(own.clone()),
            source: Some(own),
            limits,
        };
        self.set_delegate(&params).await
    }

    /// Several manager operations from one source in one envelope.
    pub async fn batch(&self, operations: &[OperationParams]) -> Result<Built> {
        let mut source: Option<Address> = None;
        let mut drafts = Vec::with_capacity(operations.len());
        for op in operations {
            let (op_source, draft) = match op {
                OperationParams::Transfer(params) => self.transfer_draft(params)?,
                OperationParams::Originate(params) => (None, self.originate_draft(params)?),
                OperationParams::Delegation(params) => self.delegation_draft(params),
            };
            if let Some(op_source) = op_source {
                match &source {
                    Some(existing) if existing != &op_source => {
                        return Err(KestrelError::Validation(
                            "batched operations must share one source".to_string(),
                        ))
                    }
                    _ => source = Some(op_source),
                }
            }
            drafts.push(draft);
        }
        self.build(source, drafts).await
    }

    /// Activation of a fundraiser account. Needs no counter or reveal.
    pub async fn activate_account(&self, pkh: &str, secret: &str) -> Result<Built> {
        if pkh.is_empty() || secret.is_empty() {
            return Err(KestrelError::Validation(
                "activation needs a public key hash and a secret".to_string(),
            ));
        }
        let (branch, head_level) = self.resolver.branch().await?;
        let envelope = OperationEnvelope::new(
            branch,
            vec![OperationContent::Activation(Activation {
                pkh: pkh.to_string(),
                secret: secret.to_string(),
            })],
        );
        Ok(Built {
            envelope,
            resolution: None,
            head_level,
        })
    }

    /// Bind drafts to `source` (the signer when `None`), a fresh branch and a
    /// contiguous counter block.
    pub async fn build(&self, source: Option<Address>, drafts: Vec<Draft>) -> Result<Built> {
        if drafts.is_empty() {
            return Err(KestrelError::Validation("nothing to emit".to_string()));
        }
        let source = match source {
            Some(source) => source,
            None => self.signer.public_key_hash().await?,
        };

        let resolution = self.resolver.resolve(&source, drafts.len() as u64).await?;
        match self.compose(&source, &resolution, drafts).await {
            Ok(envelope) => {
                info!(
                    source = %source,
                    branch = %envelope.branch,
                    contents = envelope.contents.len(),
                    reveal = resolution.needs_reveal,
                    "built envelope"
                );
                Ok(Built {
                    envelope,
                    head_level: resolution.head_level,
                    resolution: Some(resolution),
                })
            }
            Err(e) => {
                self.resolver.release(&resolution).await;
                Err(e)
            }
        }
    }

    async fn compose(
        &self,
        source: &str,
        resolution: &Resolution,
        drafts: Vec<Draft>,
    ) -> Result<OperationEnvelope> {
        let mut contents: Vec<OperationContent> = drafts
            .into_iter()
            .map(|draft| draft.into_content(source, &self.policy))
            .collect();

        if resolution.needs_reveal {
            let public_key = self.signer.public_key().await?;
            contents = self.injector.ensure_revealed(resolution, &public_key, contents);
        }

        for (content, counter) in contents.iter_mut().zip(resolution.counters()) {
            content.set_counter(counter);
        }

        let envelope = OperationEnvelope::new(resolution.branch.clone(), contents);
        envelope.validate()?;
        Ok(envelope)
    }

    pub fn resolver(&self) -> &Arc<CounterResolver> {
        &self.resolver
    }

    /// Give back the counters of an envelope that will not be injected.
    pub async fn release(&self, built: &Built) {
        if let Some(resolution) = &built.resolution {
            self.resolver.release(resolution).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::PerAccountLock;
    use kestrel_chain::{Ed25519Signer, InMemoryNode, JsonCodec, NodeRpc};
    use serde_json::json;

    struct Fixture {
        node: InMemoryNode,
        signer: Arc<Ed25519Signer>,
        builder: OperationBuilder,
    }

    async fn fixture(counter: u64, revealed: bool) -> Fixture {
        let node = InMemoryNode::new();
        let signer = Arc::new(Ed25519Signer::from_seed([21; 32]));
        node.set_counter(&signer.address(), counter).await;
        if revealed {
            node.reveal_key(&signer.encoded_public_key()).await.unwrap();
        }
        let resolver = Arc::new(CounterResolver::new(
            Arc::new(node.clone()),
            Arc::new(PerAccountLock::new()),
        ));
        let builder = OperationBuilder::new(
            resolver,
            signer.clone(),
            Arc::new(JsonCodec::new()),
            FeePolicy::default(),
        );
        Fixture {
            node,
            signer,
            builder,
        }
    }

    #[tokio::test]
    async fn test_transfer_on_unrevealed_account() {
        let f = fixture(41, false).await;
        let built = f
            .builder
            .transfer(&TransferParams::new("addr1", "1.5"))
            .await
            .unwrap();

        let contents = &built.envelope.contents;
        assert_eq!(contents.len(), 2);
        assert!(contents[0].is_reveal());
        assert_eq!(built.envelope.counters(), vec![42, 43]);
        match &contents[1] {
            OperationContent::Transaction(tx) => {
                assert_eq!(tx.amount, Mutez(1_500_000));
                assert_eq!(tx.destination, "addr1");
                assert_eq!(tx.source, f.signer.address());
                assert_eq!(tx.fee, Mutez(1420));
            }
            other => panic!("expected transaction, got {other:?}"),
        }
        assert_eq!(built.envelope.branch, f.node.head().await.unwrap().hash);
    }

    #[tokio::test]
    async fn test_batch_counters_without_reveal() {
        let f = fixture(100, true).await;
        let ops = vec![
            OperationParams::Transfer(TransferParams::new("tz1a", "1")),
            OperationParams::Transfer(TransferParams::new("tz1b", "2")),
            OperationParams::Delegation(DelegationParams::new("tz1baker")),
        ];
        let built = f.builder.batch(&ops).await.unwrap();
        assert!(built.envelope.contents.iter().all(|c| !c.is_reveal()));
        assert_eq!(built.envelope.counters(), vec![101, 102, 103]);
    }

    #[tokio::test]
    async fn test_batch_counters_with_reveal() {
        let f = fixture(100, false).await;
        let ops: Vec<_> = (0..4)
            .map(|i| OperationParams::Transfer(TransferParams::new(format!("tz1{i}"), "1")))
            .collect();
        let built = f.builder.batch(&ops).await.unwrap();
        let reveals = built.envelope.contents.iter().filter(|c| c.is_reveal()).count();
        assert_eq!(reveals, 1);
        assert_eq!(built.envelope.counters(), (101..=105).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_batch_rejects_mixed_sources() {
        let f = fixture(0, true).await;
        let ops = vec![
            OperationParams::Transfer(TransferParams::new("tz1a", "1").source("tz1x")),
            OperationParams::Transfer(TransferParams::new("tz1a", "1").source("tz1y")),
        ];
        assert!(matches!(
            f.builder.batch(&ops).await,
            Err(KestrelError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_register_delegate_targets_self() {
        let f = fixture(3, true).await;
        let built = f.builder.register_delegate(LimitOverrides::default()).await.unwrap();
        assert_eq!(built.envelope.contents.len(), 1);
        match &built.envelope.contents[0] {
            OperationContent::Delegation(d) => {
                assert_eq!(d.delegate.as_deref(), Some(f.signer.address().as_str()));
                assert_eq!(d.source, f.signer.address());
                assert_eq!(d.counter, 4);
            }
            other => panic!("expected delegation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_set_delegate_with_explicit_source() {
        let f = fixture(0, true).await;
        let params = DelegationParams::new("tz1baker").source("tz1other");
        let built = f.builder.set_delegate(&params).await.unwrap();
        assert_eq!(built.envelope.source(), Some("tz1other"));
    }

    #[tokio::test]
    async fn test_originate_converts_text_and_omits_delegate() {
        let f = fixture(0, true).await;
        let params = OriginateParams::new(
            "parameter unit; storage nat; code { CDR ; NIL operation ; PAIR }",
            "0",
        )
        .balance("2.5")
        .limits(LimitOverrides::default().storage_limit(1000));
        let built = f.builder.originate(&params).await.unwrap();

        match &built.envelope.contents[0] {
            OperationContent::Origination(orig) => {
                assert_eq!(orig.balance, Mutez(2_500_000));
                assert_eq!(orig.script.code.as_array().map(Vec::len), Some(3));
                assert_eq!(orig.script.storage, json!({"int": "0"}));
                assert_eq!(orig.storage_limit, 1000);
                assert_eq!(orig.gas_limit, 10_600);
                assert_eq!(orig.manager_pubkey, f.signer.address());
            }
            other => panic!("expected origination, got {other:?}"),
        }
        let json = serde_json::to_value(&built.envelope.contents[0]).unwrap();
        assert!(json.get("delegate").is_none());
    }

    #[tokio::test]
    async fn test_validation_happens_before_network() {
        let f = fixture(0, false).await;
        f.node.fail_next_reads(100);

        let err = f
            .builder
            .transfer(&TransferParams::new("addr1", "0.0000001"))
            .await
            .unwrap_err();
        assert!(matches!(err, KestrelError::Validation(_)));

        let err = f
            .builder
            .transfer(&TransferParams::new("addr1", "1").parameter("Pair 1 (2"))
            .await
            .unwrap_err();
        assert!(matches!(err, KestrelError::Validation(_)));

        let err = f
            .builder
            .originate(&OriginateParams::new("parameter unit;", json!({"int": "0"})))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("code"));
    }

    #[tokio::test]
    async fn test_text_parameter_is_converted() {
        let f = fixture(0, true).await;
        let params = TransferParams::new("KT1x", "0").parameter("Pair 1 2");
        let built = f.builder.transfer(&params).await.unwrap();
        match &built.envelope.contents[0] {
            OperationContent::Transaction(tx) => assert_eq!(
                tx.parameters,
                Some(json!({"prim": "Pair", "args": [{"int": "1"}, {"int": "2"}]}))
            ),
            other => panic!("expected transaction, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_raw_parameter_passes_through() {
        let f = fixture(0, true).await;
        let params = TransferParams::new("KT1x", "5")
            .mutez()
            .raw_parameter(r#"{"entrypoint": "default", "value": {"int": "1"}}"#);
        let built = f.builder.transfer(&params).await.unwrap();
        match &built.envelope.contents[0] {
            OperationContent::Transaction(tx) => {
                assert_eq!(tx.amount, Mutez(5));
                assert_eq!(
                    tx.parameters,
                    Some(json!({"entrypoint": "default", "value": {"int": "1"}}))
                );
            }
            other => panic!("expected transaction, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_activation_has_no_counter() {
        let f = fixture(0, false).await;
        let built = f.builder.activate_account("tz1fund", "deadbeef").await.unwrap();
        assert!(built.resolution.is_none());
        assert!(built.envelope.counters().is_empty());
        assert_eq!(built.envelope.contents[0].kind(), OperationKind::Activation);
    }
}
