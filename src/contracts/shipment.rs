//! Shipment lifecycle legality.
//!
//! Shipments move along a fixed path with no skips and no reversals:
//! `Created -> Validated -> InTransit -> Delivered -> Confirmed`. `Confirmed` is terminal.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::{
    ContractError, ContractOutput, ContractState, ContractValue, ExecutionContext, SmartContract,
};
use crate::types::TransactionType;

pub const SHIPMENT_LIFECYCLE_CONTRACT_ID: &str = "shipment-lifecycle";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShipmentStatus {
    Created,
    Validated,
    InTransit,
    Delivered,
    Confirmed,
}

impl ShipmentStatus {
    /// The only status this one may move to.
    pub fn next(&self) -> Option<ShipmentStatus> {
        match self {
            ShipmentStatus::Created => Some(ShipmentStatus::Validated),
            ShipmentStatus::Validated => Some(ShipmentStatus::InTransit),
            ShipmentStatus::InTransit => Some(ShipmentStatus::Delivered),
            ShipmentStatus::Delivered => Some(ShipmentStatus::Confirmed),
            ShipmentStatus::Confirmed => None,
        }
    }

    pub fn can_transition_to(&self, target: ShipmentStatus) -> bool {
        self.next() == Some(target)
    }

    pub fn is_terminal(&self) -> bool {
        self.next().is_none()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ShipmentStatus::Created => "Created",
            ShipmentStatus::Validated => "Validated",
            ShipmentStatus::InTransit => "InTransit",
            ShipmentStatus::Delivered => "Delivered",
            ShipmentStatus::Confirmed => "Confirmed",
        }
    }
}

impl fmt::Display for ShipmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ShipmentStatus {
    type Err = ContractError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Created" => Ok(ShipmentStatus::Created),
            "Validated" => Ok(ShipmentStatus::Validated),
            "InTransit" => Ok(ShipmentStatus::InTransit),
            "Delivered" => Ok(ShipmentStatus::Delivered),
            "Confirmed" => Ok(ShipmentStatus::Confirmed),
            other => Err(ContractError::InvalidPayload(format!(
                "unknown shipment status: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShipmentPayload {
    shipment_id: String,
    status: Option<ShipmentStatus>,
}

fn status_key(shipment_id: &str) -> String {
    format!("shipment:{}:status", shipment_id)
}

fn updated_key(shipment_id: &str) -> String {
    format!("shipment:{}:updatedAt", shipment_id)
}

#[derive(Debug, Default)]
pub struct ShipmentLifecycleContract;

impl ShipmentLifecycleContract {
    pub fn new() -> Self {
        Self
    }

    /// Status recorded in `state` for `shipment_id`.
    pub fn status_in(state: &ContractState, shipment_id: &str) -> Option<ShipmentStatus> {
        state
            .get(&status_key(shipment_id))
            .and_then(ContractValue::as_str)
            .and_then(|s| s.parse().ok())
    }

    fn register(
        &self,
        ctx: &ExecutionContext,
        state: &ContractState,
        payload: ShipmentPayload,
    ) -> Result<ContractOutput, ContractError> {
        if state.contains_key(&status_key(&payload.shipment_id)) {
            return Err(ContractError::Rejected(format!(
                "shipment {} already exists",
                payload.shipment_id
            )));
        }
        Ok(ContractOutput::new()
            .with_output(format!("shipment {} registered", payload.shipment_id))
            .set(status_key(&payload.shipment_id), ShipmentStatus::Created.as_str())
            .set(updated_key(&payload.shipment_id), ctx.executed_at)
            .emit(
                "ShipmentRegistered",
                [
                    ("shipmentId", ContractValue::from(payload.shipment_id.as_str())),
                    ("status", ContractValue::from(ShipmentStatus::Created.as_str())),
                ],
            ))
    }

    fn transition(
        &self,
        ctx: &ExecutionContext,
        state: &ContractState,
        payload: ShipmentPayload,
    ) -> Result<ContractOutput, ContractError> {
        let target = payload
            .status
            .ok_or_else(|| ContractError::InvalidPayload("missing status".to_string()))?;
        let current = Self::status_in(state, &payload.shipment_id).ok_or_else(|| {
            ContractError::Rejected(format!("unknown shipment {}", payload.shipment_id))
        })?;
        if !current.can_transition_to(target) {
            return Err(ContractError::Rejected(format!(
                "illegal transition {} -> {} for shipment {}",
                current, target, payload.shipment_id
            )));
        }
        Ok(ContractOutput::new()
            .with_output(format!("shipment {} is now {}", payload.shipment_id, target))
            .set(status_key(&payload.shipment_id), target.as_str())
            .set(updated_key(&payload.shipment_id), ctx.executed_at)
            .emit(
                "ShipmentStatusChanged",
                [
                    ("shipmentId", ContractValue::from(payload.shipment_id.as_str())),
                    ("from", ContractValue::from(current.as_str())),
                    ("to", ContractValue::from(target.as_str())),
                ],
            ))
    }
}

impl SmartContract for ShipmentLifecycleContract {
    fn id(&self) -> &str {
        SHIPMENT_LIFECYCLE_CONTRACT_ID
    }

    fn name(&self) -> &str {
        "Shipment Lifecycle"
    }

    fn can_execute(&self, ctx: &ExecutionContext) -> bool {
        matches!(
            ctx.transaction.tx_type,
            TransactionType::ShipmentCreated | TransactionType::StatusUpdated
        )
    }

    fn execute(
        &self,
        ctx: &ExecutionContext,
        state: &ContractState,
    ) -> Result<ContractOutput, ContractError> {
        let payload: ShipmentPayload = ctx.payload()?;
        match ctx.transaction.tx_type {
            TransactionType::ShipmentCreated => self.register(ctx, state, payload),
            TransactionType::StatusUpdated => self.transition(ctx, state, payload),
            other => Err(ContractError::Rejected(format!(
                "unsupported transaction type {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::ContractEngine;
    use crate::types::Transaction;
    use std::sync::Arc;

    fn ctx(tx_type: TransactionType, payload: &str) -> ExecutionContext {
        ExecutionContext::new(Transaction::new(tx_type, "coordinator", payload), None)
    }

    fn update(engine: &ContractEngine, status: &str) -> bool {
        engine
            .execute(
                SHIPMENT_LIFECYCLE_CONTRACT_ID,
                &ctx(
                    TransactionType::StatusUpdated,
                    &format!(r#"{{"shipmentId":"S-1","status":"{}"}}"#, status),
                ),
            )
            .success
    }

    #[test]
    fn test_transition_graph() {
        assert!(ShipmentStatus::Created.can_transition_to(ShipmentStatus::Validated));
        assert!(!ShipmentStatus::Created.can_transition_to(ShipmentStatus::InTransit));
        assert!(!ShipmentStatus::Delivered.can_transition_to(ShipmentStatus::InTransit));
        assert!(ShipmentStatus::Confirmed.is_terminal());
        assert_eq!(ShipmentStatus::Confirmed.next(), None);
    }

    #[test]
    fn test_full_lifecycle() {
        let engine = ContractEngine::new();
        engine.deploy(Arc::new(ShipmentLifecycleContract::new()));

        let created = engine.execute(
            SHIPMENT_LIFECYCLE_CONTRACT_ID,
            &ctx(TransactionType::ShipmentCreated, r#"{"shipmentId":"S-1"}"#),
        );
        assert!(created.success);
        assert_eq!(created.events[0].name, "ShipmentRegistered");

        // no skipping ahead
        assert!(!update(&engine, "InTransit"));
        for status in ["Validated", "InTransit", "Delivered", "Confirmed"] {
            assert!(update(&engine, status), "transition to {}", status);
        }
        // no reversals, terminal state
        assert!(!update(&engine, "Delivered"));
        assert!(!update(&engine, "Confirmed"));

        let state = engine.state(SHIPMENT_LIFECYCLE_CONTRACT_ID).unwrap();
        assert_eq!(
            ShipmentLifecycleContract::status_in(&state, "S-1"),
            Some(ShipmentStatus::Confirmed)
        );
    }

    #[test]
    fn test_rejects_duplicates_and_unknown_shipments() {
        let engine = ContractEngine::new();
        engine.deploy(Arc::new(ShipmentLifecycleContract::new()));

        assert!(!update(&engine, "Validated"));

        let create = ctx(TransactionType::ShipmentCreated, r#"{"shipmentId":"S-1"}"#);
        assert!(engine.execute(SHIPMENT_LIFECYCLE_CONTRACT_ID, &create).success);
        assert!(!engine.execute(SHIPMENT_LIFECYCLE_CONTRACT_ID, &create).success);

        let garbage = ctx(TransactionType::StatusUpdated, "not json");
        let result = engine.execute(SHIPMENT_LIFECYCLE_CONTRACT_ID, &garbage);
        assert!(!result.success);
        assert!(result.error_message.unwrap().starts_with("Invalid payload"));
    }

    #[test]
    fn test_ignores_other_transaction_types() {
        let contract = ShipmentLifecycleContract::new();
        let confirm = ctx(TransactionType::DeliveryConfirmed, r#"{"shipmentId":"S-1"}"#);
        assert!(!contract.can_execute(&confirm));
    }
}
