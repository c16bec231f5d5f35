//! Supplier payment release on confirmed delivery.
//!
//! Supplier verification is learned from `SupplierVerified` transactions (or a
//! `supplierVerified` context hint). When verifiers are configured only their
//! keys may verify suppliers. The contract keeps its own copy of each
//! shipment's recipient from `ShipmentCreated`, and only a `DeliveryConfirmed`
//! sent by that recipient can release money. A payment is initiated for
//! verified suppliers whose amount meets the configured minimum; anything else
//! is skipped, which is a successful no-op.

use serde::Deserialize;
use std::collections::BTreeSet;

use super::delivery::CONFIRMATION_CODE_HINT;
use super::{
    ContractError, ContractOutput, ContractState, ContractValue, ExecutionContext, SmartContract,
};
use crate::types::TransactionType;

pub const PAYMENT_RELEASE_CONTRACT_ID: &str = "payment-release";
/// Context data key overriding the recorded supplier verification status.
pub const SUPPLIER_VERIFIED_HINT: &str = "supplierVerified";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerificationPayload {
    supplier_id: String,
    #[serde(default = "default_verified")]
    verified: bool,
}

fn default_verified() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShipmentPayload {
    shipment_id: String,
    recipient_public_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReleasePayload {
    shipment_id: String,
    supplier_id: Option<String>,
    payment_amount: Option<f64>,
    confirmation_code: Option<String>,
}

fn supplier_key(supplier_id: &str) -> String {
    format!("supplier:{}:verified", supplier_id)
}

fn recipient_key(shipment_id: &str) -> String {
    format!("shipment:{}:recipient", shipment_id)
}

fn payment_key(shipment_id: &str, field: &str) -> String {
    format!("payment:{}:{}", shipment_id, field)
}

#[derive(Debug)]
pub struct PaymentReleaseContract {
    minimum_amount: f64,
    /// Keys allowed to send `SupplierVerified`. Empty accepts any signer.
    verifiers: BTreeSet<String>,
}

impl PaymentReleaseContract {
    pub fn new(minimum_amount: f64) -> Self {
        Self {
            minimum_amount,
            verifiers: BTreeSet::new(),
        }
    }

    pub fn with_verifiers<I, S>(mut self, verifiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.verifiers = verifiers.into_iter().map(Into::into).collect();
        self
    }

    fn record_recipient(
        &self,
        ctx: &ExecutionContext,
        state: &ContractState,
    ) -> Result<ContractOutput, ContractError> {
        let payload: ShipmentPayload = ctx.payload()?;
        let recipient = payload
            .recipient_public_key
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                ContractError::InvalidPayload("missing recipientPublicKey".to_string())
            })?;
        if state.contains_key(&recipient_key(&payload.shipment_id)) {
            return Err(ContractError::Rejected(format!(
                "shipment {} already has a recipient",
                payload.shipment_id
            )));
        }
        Ok(ContractOutput::new()
            .with_output(format!(
                "payee recipient recorded for shipment {}",
                payload.shipment_id
            ))
            .set(recipient_key(&payload.shipment_id), recipient))
    }

    fn record_verification(&self, ctx: &ExecutionContext) -> Result<ContractOutput, ContractError> {
        let sender = &ctx.transaction.sender_public_key;
        if !self.verifiers.is_empty() && !self.verifiers.contains(sender) {
            return Err(ContractError::Unauthorized(format!(
                "{} may not verify suppliers",
                sender
            )));
        }
        let payload: VerificationPayload = ctx.payload()?;
        Ok(ContractOutput::new()
            .with_output(format!(
                "supplier {} verification set to {}",
                payload.supplier_id, payload.verified
            ))
            .set(supplier_key(&payload.supplier_id), payload.verified)
            .emit(
                "SupplierVerificationRecorded",
                [
                    ("supplierId", ContractValue::from(payload.supplier_id.as_str())),
                    ("verified", ContractValue::from(payload.verified)),
                ],
            ))
    }

    fn release(
        &self,
        ctx: &ExecutionContext,
        state: &ContractState,
    ) -> Result<ContractOutput, ContractError> {
        let payload: ReleasePayload = ctx.payload()?;
        let shipment = payload.shipment_id.as_str();

        let (supplier, amount) = match (payload.supplier_id.as_deref(), payload.payment_amount) {
            (Some(supplier), Some(amount)) => (supplier, amount),
            _ => return Ok(skipped(shipment, "no payment terms")),
        };
        if state.contains_key(&payment_key(shipment, "status")) {
            return Ok(skipped(shipment, "payment already initiated"));
        }

        let recipient = state
            .get(&recipient_key(shipment))
            .and_then(ContractValue::as_str);
        if recipient != Some(ctx.transaction.sender_public_key.as_str()) {
            return Err(ContractError::Unauthorized(format!(
                "confirmation of shipment {} is not from its recipient",
                shipment
            )));
        }
        let expected_code = ctx
            .data
            .get(CONFIRMATION_CODE_HINT)
            .and_then(ContractValue::as_str);
        if let Some(expected) = expected_code {
            if payload.confirmation_code.as_deref() != Some(expected) {
                return Err(ContractError::Rejected(format!(
                    "confirmation code mismatch for shipment {}",
                    shipment
                )));
            }
        }

        let verified = ctx
            .data
            .get(SUPPLIER_VERIFIED_HINT)
            .and_then(ContractValue::as_bool)
            .or_else(|| state.get(&supplier_key(supplier)).and_then(ContractValue::as_bool))
            .unwrap_or(false);
        if !verified {
            return Ok(skipped(shipment, "supplier not verified"));
        }
        if !(amount > 0.0 && amount >= self.minimum_amount) {
            return Ok(skipped(shipment, "amount below payment threshold"));
        }

        Ok(ContractOutput::new()
            .with_output(format!("payment of {} initiated for shipment {}", amount, shipment))
            .set(payment_key(shipment, "status"), "Initiated")
            .set(payment_key(shipment, "amount"), amount)
            .set(payment_key(shipment, "supplier"), supplier)
            .set(payment_key(shipment, "initiatedAt"), ctx.executed_at)
            .emit(
                "PaymentInitiated",
                [
                    ("shipmentId", ContractValue::from(shipment)),
                    ("supplierId", ContractValue::from(supplier)),
                    ("amount", ContractValue::from(amount)),
                ],
            ))
    }
}

fn skipped(shipment_id: &str, reason: &str) -> ContractOutput {
    ContractOutput::new().with_output(format!(
        "payment for shipment {} skipped: {}",
        shipment_id, reason
    ))
}

impl SmartContract for PaymentReleaseContract {
    fn id(&self) -> &str {
        PAYMENT_RELEASE_CONTRACT_ID
    }

    fn name(&self) -> &str {
        "Payment Release"
    }

    fn can_execute(&self, ctx: &ExecutionContext) -> bool {
        match ctx.transaction.tx_type {
            TransactionType::SupplierVerified | TransactionType::DeliveryConfirmed => true,
            TransactionType::ShipmentCreated => ctx
                .payload::<ShipmentPayload>()
                .map(|p| p.recipient_public_key.is_some())
                .unwrap_or(false),
            _ => false,
        }
    }

    fn execute(
        &self,
        ctx: &ExecutionContext,
        state: &ContractState,
    ) -> Result<ContractOutput, ContractError> {
        match ctx.transaction.tx_type {
            TransactionType::ShipmentCreated => self.record_recipient(ctx, state),
            TransactionType::SupplierVerified => self.record_verification(ctx),
            TransactionType::DeliveryConfirmed => self.release(ctx, state),
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

    const RECIPIENT: &str = "recipient-key";

    fn ctx(tx_type: TransactionType, sender: &str, payload: &str) -> ExecutionContext {
        ExecutionContext::new(Transaction::new(tx_type, sender, payload), None)
    }

    fn delivery_from(sender: &str, amount: f64) -> ExecutionContext {
        ctx(
            TransactionType::DeliveryConfirmed,
            sender,
            &format!(
                r#"{{"shipmentId":"S-1","supplierId":"SUP-1","paymentAmount":{}}}"#,
                amount
            ),
        )
    }

    fn delivery(amount: f64) -> ExecutionContext {
        delivery_from(RECIPIENT, amount)
    }

    fn deploy(contract: PaymentReleaseContract) -> ContractEngine {
        let engine = ContractEngine::new();
        engine.deploy(Arc::new(contract));
        let created = ctx(
            TransactionType::ShipmentCreated,
            "coordinator",
            &format!(r#"{{"shipmentId":"S-1","recipientPublicKey":"{}"}}"#, RECIPIENT),
        );
        assert!(engine.execute(PAYMENT_RELEASE_CONTRACT_ID, &created).success);
        engine
    }

    fn engine(minimum: f64) -> ContractEngine {
        deploy(PaymentReleaseContract::new(minimum))
    }

    fn verify_supplier(engine: &ContractEngine, sender: &str) -> bool {
        engine
            .execute(
                PAYMENT_RELEASE_CONTRACT_ID,
                &ctx(TransactionType::SupplierVerified, sender, r#"{"supplierId":"SUP-1"}"#),
            )
            .success
    }

    #[test]
    fn test_unverified_supplier_is_skipped() {
        let engine = engine(100.0);
        let result = engine.execute(PAYMENT_RELEASE_CONTRACT_ID, &delivery(500.0));
        assert!(result.success);
        assert!(result.state_changes.is_empty());
        assert!(result.output.unwrap().contains("not verified"));
    }

    #[test]
    fn test_below_threshold_is_skipped() {
        let engine = engine(100.0);
        assert!(verify_supplier(&engine, "auditor"));
        let result = engine.execute(PAYMENT_RELEASE_CONTRACT_ID, &delivery(50.0));
        assert!(result.success);
        assert!(result.events.is_empty());
        assert!(result.output.unwrap().contains("threshold"));
    }

    #[test]
    fn test_payment_initiated_once() {
        let engine = engine(100.0);
        assert!(verify_supplier(&engine, "auditor"));

        let first = engine.execute(PAYMENT_RELEASE_CONTRACT_ID, &delivery(250.0));
        assert!(first.success);
        assert_eq!(first.events[0].name, "PaymentInitiated");
        assert_eq!(
            first.state_changes["payment:S-1:status"],
            ContractValue::from("Initiated")
        );

        let second = engine.execute(PAYMENT_RELEASE_CONTRACT_ID, &delivery(250.0));
        assert!(second.success);
        assert!(second.state_changes.is_empty());

        let state = engine.state(PAYMENT_RELEASE_CONTRACT_ID).unwrap();
        assert_eq!(state["payment:S-1:amount"], ContractValue::Number(250.0));
    }

    #[test]
    fn test_confirmation_from_non_recipient_releases_nothing() {
        let engine = engine(0.0);
        assert!(verify_supplier(&engine, "auditor"));

        let intruder = engine.execute(
            PAYMENT_RELEASE_CONTRACT_ID,
            &delivery_from("intruder-key", 1_000_000.0),
        );
        assert!(!intruder.success);
        assert!(intruder.error_message.unwrap().starts_with("Unauthorized"));
        let state = engine.state(PAYMENT_RELEASE_CONTRACT_ID).unwrap();
        assert!(!state.contains_key("payment:S-1:status"));

        // A second ShipmentCreated cannot swap the payee.
        let hijack = ctx(
            TransactionType::ShipmentCreated,
            "intruder-key",
            r#"{"shipmentId":"S-1","recipientPublicKey":"intruder-key"}"#,
        );
        assert!(!engine.execute(PAYMENT_RELEASE_CONTRACT_ID, &hijack).success);
        assert!(!engine
            .execute(PAYMENT_RELEASE_CONTRACT_ID, &delivery_from("intruder-key", 10.0))
            .success);

        assert!(engine.execute(PAYMENT_RELEASE_CONTRACT_ID, &delivery(10.0)).success);
        let state = engine.state(PAYMENT_RELEASE_CONTRACT_ID).unwrap();
        assert_eq!(state["payment:S-1:amount"], ContractValue::Number(10.0));
    }

    #[test]
    fn test_unknown_shipment_is_unauthorized() {
        let engine = ContractEngine::new();
        engine.deploy(Arc::new(PaymentReleaseContract::new(0.0)));
        let hinted = delivery(10.0).with_data(SUPPLIER_VERIFIED_HINT, true);
        assert!(!engine.execute(PAYMENT_RELEASE_CONTRACT_ID, &hinted).success);
    }

    #[test]
    fn test_confirmation_code_must_match_hint() {
        let engine = engine(0.0);
        let wrong = delivery(10.0)
            .with_data(SUPPLIER_VERIFIED_HINT, true)
            .with_data(CONFIRMATION_CODE_HINT, "QR-123");
        assert!(!engine.execute(PAYMENT_RELEASE_CONTRACT_ID, &wrong).success);
    }

    #[test]
    fn test_only_configured_verifiers_verify_suppliers() {
        let engine = deploy(PaymentReleaseContract::new(0.0).with_verifiers(["auditor"]));
        assert!(!verify_supplier(&engine, "supplier-itself"));
        let skipped = engine.execute(PAYMENT_RELEASE_CONTRACT_ID, &delivery(10.0));
        assert!(skipped.output.unwrap().contains("not verified"));

        assert!(verify_supplier(&engine, "auditor"));
        let paid = engine.execute(PAYMENT_RELEASE_CONTRACT_ID, &delivery(10.0));
        assert_eq!(paid.events[0].name, "PaymentInitiated");
    }

    #[test]
    fn test_context_hint_overrides_recorded_status() {
        let engine = engine(0.0);
        let hinted = delivery(10.0).with_data(SUPPLIER_VERIFIED_HINT, true);
        let result = engine.execute(PAYMENT_RELEASE_CONTRACT_ID, &hinted);
        assert!(result.success);
        assert_eq!(result.events.len(), 1);
    }

    #[test]
    fn test_delivery_without_terms() {
        let engine = engine(0.0);
        let result = engine.execute(
            PAYMENT_RELEASE_CONTRACT_ID,
            &ctx(TransactionType::DeliveryConfirmed, RECIPIENT, r#"{"shipmentId":"S-1"}"#),
        );
        assert!(result.success);
        assert!(result.output.unwrap().contains("no payment terms"));
    }
}
