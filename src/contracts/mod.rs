//! Smart contract execution engine.
//!
//! Contracts are independent units of business logic that react to committed
//! ledger transactions. Each deployed contract owns an isolated key-value state
//! that only its own successful executions may change. Failures, whether
//! returned errors or panics, are converted into failure results at the engine
//! boundary so one misbehaving contract cannot disturb the others.

pub mod delivery;
pub mod payment;
pub mod shipment;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::types::{now, Block, Transaction};

pub use delivery::DeliveryConfirmationContract;
pub use payment::PaymentReleaseContract;
pub use shipment::{ShipmentLifecycleContract, ShipmentStatus};

/// Event name emitted when a contract execution fails.
pub const EXECUTION_FAILED_EVENT: &str = "ContractExecutionFailed";

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
    #[error("Rejected: {0}")]
    Rejected(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Contract not found: {0}")]
    ContractNotFound(String),
}

/// Loosely typed value stored in contract state and event data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum ContractValue {
    String(String),
    Number(f64),
    Bool(bool),
    Timestamp(DateTime<Utc>),
}

impl ContractValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ContractValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ContractValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ContractValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            ContractValue::Timestamp(t) => Some(*t),
            _ => None,
        }
    }
}

impl From<&str> for ContractValue {
    fn from(s: &str) -> Self {
        ContractValue::String(s.to_string())
    }
}

impl From<String> for ContractValue {
    fn from(s: String) -> Self {
        ContractValue::String(s)
    }
}

impl From<f64> for ContractValue {
    fn from(n: f64) -> Self {
        ContractValue::Number(n)
    }
}

impl From<bool> for ContractValue {
    fn from(b: bool) -> Self {
        ContractValue::Bool(b)
    }
}

impl From<DateTime<Utc>> for ContractValue {
    fn from(t: DateTime<Utc>) -> Self {
        ContractValue::Timestamp(t)
    }
}

pub type ContractState = BTreeMap<String, ContractValue>;

/// Everything a contract sees when it runs.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub transaction: Transaction,
    pub block: Option<Block>,
    pub executed_at: DateTime<Utc>,
    /// Out-of-band hints supplied by the caller, e.g. a pre-validated QR payload
    pub data: BTreeMap<String, ContractValue>,
}

impl ExecutionContext {
    pub fn new(transaction: Transaction, block: Option<Block>) -> Self {
        Self {
            transaction,
            block,
            executed_at: now(),
            data: BTreeMap::new(),
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<ContractValue>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Parse the transaction payload as JSON into `T`.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, ContractError> {
        serde_json::from_str(&self.transaction.payload_data)
            .map_err(|e| ContractError::InvalidPayload(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractEvent {
    pub name: String,
    pub contract_id: String,
    pub transaction_id: String,
    pub data: BTreeMap<String, ContractValue>,
    pub emitted_at: DateTime<Utc>,
}

/// What a contract hands back on success.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContractOutput {
    pub output: Option<String>,
    pub state_changes: ContractState,
    pub events: Vec<(String, BTreeMap<String, ContractValue>)>,
}

impl ContractOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<ContractValue>) -> Self {
        self.state_changes.insert(key.into(), value.into());
        self
    }

    pub fn emit(
        mut self,
        name: impl Into<String>,
        data: impl IntoIterator<Item = (&'static str, ContractValue)>,
    ) -> Self {
        let data = data.into_iter().map(|(k, v)| (k.to_string(), v)).collect();
        self.events.push((name.into(), data));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub contract_id: String,
    pub transaction_id: String,
    pub success: bool,
    pub output: Option<String>,
    pub state_changes: ContractState,
    pub events: Vec<ContractEvent>,
    pub error_message: Option<String>,
}

impl ExecutionResult {
    fn failure(
        contract_id: &str,
        ctx: &ExecutionContext,
        message: String,
        events: Vec<ContractEvent>,
    ) -> Self {
        Self {
            contract_id: contract_id.to_string(),
            transaction_id: ctx.transaction.id.clone(),
            success: false,
            output: None,
            state_changes: ContractState::new(),
            events,
            error_message: Some(message),
        }
    }
}

/// A pluggable unit of business logic.
pub trait SmartContract: Send + Sync {
    fn id(&self) -> &str;

    fn name(&self) -> &str;

    fn version(&self) -> &str {
        "1.0.0"
    }

    /// Whether this contract wants to see the transaction in `ctx`.
    fn can_execute(&self, ctx: &ExecutionContext) -> bool;

    /// Run against a read-only view of this contract's state.
    fn execute(
        &self,
        ctx: &ExecutionContext,
        state: &ContractState,
    ) -> Result<ContractOutput, ContractError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractInfo {
    pub id: String,
    pub name: String,
    pub version: String,
    pub deployed_at: DateTime<Utc>,
}

#[derive(Clone)]
struct DeployedContract {
    contract: Arc<dyn SmartContract>,
    state: Arc<Mutex<ContractState>>,
    deployed_at: DateTime<Utc>,
}

/// Registry of deployed contracts in deployment order.
///
/// Executions of the same contract are serialized on that contract's state
/// lock; different contracts run independently.
#[derive(Default)]
pub struct ContractEngine {
    contracts: RwLock<Vec<DeployedContract>>,
}

impl ContractEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine with the shipment lifecycle, delivery confirmation and the given
    /// payment release contract deployed.
    pub fn with_builtin_contracts(payment: PaymentReleaseContract) -> Self {
        let engine = Self::new();
        engine.deploy(Arc::new(ShipmentLifecycleContract::new()));
        engine.deploy(Arc::new(DeliveryConfirmationContract::new()));
        engine.deploy(Arc::new(payment));
        engine
    }

    /// Returns `false` if a contract with the same id is already deployed.
    pub fn deploy(&self, contract: Arc<dyn SmartContract>) -> bool {
        let mut contracts = self.contracts.write();
        if contracts.iter().any(|c| c.contract.id() == contract.id()) {
            warn!(contract = contract.id(), "Contract already deployed");
            return false;
        }
        info!(contract = contract.id(), version = contract.version(), "Contract deployed");
        contracts.push(DeployedContract {
            contract,
            state: Arc::new(Mutex::new(ContractState::new())),
            deployed_at: now(),
        });
        true
    }

    pub fn undeploy(&self, contract_id: &str) -> bool {
        let mut contracts = self.contracts.write();
        let before = contracts.len();
        contracts.retain(|c| c.contract.id() != contract_id);
        before != contracts.len()
    }

    pub fn is_deployed(&self, contract_id: &str) -> bool {
        self.find(contract_id).is_some()
    }

    pub fn deployed(&self) -> Vec<ContractInfo> {
        self.contracts
            .read()
            .iter()
            .map(|c| ContractInfo {
                id: c.contract.id().to_string(),
                name: c.contract.name().to_string(),
                version: c.contract.version().to_string(),
                deployed_at: c.deployed_at,
            })
            .collect()
    }

    /// Copy of a contract's current state.
    pub fn state(&self, contract_id: &str) -> Option<ContractState> {
        self.find(contract_id).map(|c| c.state.lock().clone())
    }

    pub fn execute(&self, contract_id: &str, ctx: &ExecutionContext) -> ExecutionResult {
        let Some(deployed) = self.find(contract_id) else {
            return ExecutionResult::failure(
                contract_id,
                ctx,
                ContractError::ContractNotFound(contract_id.to_string()).to_string(),
                Vec::new(),
            );
        };
        match applies(&deployed, ctx) {
            Ok(true) => invoke(&deployed, ctx),
            Ok(false) => ExecutionResult::failure(
                contract_id,
                ctx,
                format!(
                    "Contract {} cannot execute {} transactions in this context",
                    contract_id, ctx.transaction.tx_type
                ),
                Vec::new(),
            ),
            Err(message) => failed(contract_id, ctx, message),
        }
    }

    /// Run every contract that claims the transaction in `ctx`. A contract
    /// whose predicate panics is reported as failed.
    pub fn execute_applicable(&self, ctx: &ExecutionContext) -> Vec<ExecutionResult> {
        let contracts = self.contracts.read().clone();
        contracts
            .iter()
            .filter_map(|c| match applies(c, ctx) {
                Ok(true) => Some(invoke(c, ctx)),
                Ok(false) => None,
                Err(message) => Some(failed(c.contract.id(), ctx, message)),
            })
            .collect()
    }

    /// Dispatch each transaction of a committed block in order.
    pub fn execute_for_block(&self, block: &Block) -> Vec<ExecutionResult> {
        block
            .transactions
            .iter()
            .flat_map(|tx| {
                let ctx = ExecutionContext::new(tx.clone(), Some(block.clone()));
                self.execute_applicable(&ctx)
            })
            .collect()
    }

    fn find(&self, contract_id: &str) -> Option<DeployedContract> {
        self.contracts
            .read()
            .iter()
            .find(|c| c.contract.id() == contract_id)
            .cloned()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

fn applies(deployed: &DeployedContract, ctx: &ExecutionContext) -> Result<bool, String> {
    panic::catch_unwind(AssertUnwindSafe(|| deployed.contract.can_execute(ctx)))
        .map_err(|payload| format!("Contract predicate panicked: {}", panic_message(payload)))
}

fn invoke(deployed: &DeployedContract, ctx: &ExecutionContext) -> ExecutionResult {
    let contract_id = deployed.contract.id();
    let mut state = deployed.state.lock();

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| deployed.contract.execute(ctx, &state)));
    let message = match outcome {
        Ok(Ok(output)) => {
            if !output.state_changes.is_empty() {
                state.extend(output.state_changes.clone());
            }
            let events = output
                .events
                .into_iter()
                .map(|(name, data)| ContractEvent {
                    name,
                    contract_id: contract_id.to_string(),
                    transaction_id: ctx.transaction.id.clone(),
                    data,
                    emitted_at: ctx.executed_at,
                })
                .collect();
            debug!(contract = contract_id, tx = %ctx.transaction.id, "Contract executed");
            return ExecutionResult {
                contract_id: contract_id.to_string(),
                transaction_id: ctx.transaction.id.clone(),
                success: true,
                output: output.output,
                state_changes: output.state_changes,
                events,
                error_message: None,
            };
        }
        Ok(Err(e)) => e.to_string(),
        Err(payload) => format!("Contract panicked: {}", panic_message(payload)),
    };
    drop(state);
    failed(contract_id, ctx, message)
}

/// Failure result carrying the diagnostic event.
fn failed(contract_id: &str, ctx: &ExecutionContext, message: String) -> ExecutionResult {
    warn!(
        contract = contract_id,
        tx = %ctx.transaction.id,
        error = %message,
        "Contract execution failed"
    );
    let diagnostic = ContractEvent {
        name: EXECUTION_FAILED_EVENT.to_string(),
        contract_id: contract_id.to_string(),
        transaction_id: ctx.transaction.id.clone(),
        data: BTreeMap::from([("error".to_string(), ContractValue::String(message.clone()))]),
        emitted_at: ctx.executed_at,
    };
    ExecutionResult::failure(contract_id, ctx, message, vec![diagnostic])
}
