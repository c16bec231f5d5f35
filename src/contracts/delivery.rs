//! Delivery confirmation authorization.
//!
//! The recipient assigned when a shipment is created is the only key allowed to
//! confirm its delivery. When the caller supplies a pre-validated out-of-band
//! code (for example scanned from a QR label) under [`CONFIRMATION_CODE_HINT`],
//! the code in the transaction payload must match it.

use serde::Deserialize;

use super::{
    ContractError, ContractOutput, ContractState, ContractValue, ExecutionContext, SmartContract,
};
use crate::types::TransactionType;

pub const DELIVERY_CONFIRMATION_CONTRACT_ID: &str = "delivery-confirmation";
/// Context data key carrying an externally verified confirmation code.
pub const CONFIRMATION_CODE_HINT: &str = "confirmationCode";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssignmentPayload {
    shipment_id: String,
    recipient_public_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfirmationPayload {
    shipment_id: String,
    confirmation_code: Option<String>,
}

fn recipient_key(shipment_id: &str) -> String {
    format!("shipment:{}:recipient", shipment_id)
}

fn confirmed_key(shipment_id: &str) -> String {
    format!("shipment:{}:confirmed", shipment_id)
}

#[derive(Debug, Default)]
pub struct DeliveryConfirmationContract;

impl DeliveryConfirmationContract {
    pub fn new() -> Self {
        Self
    }

    fn assign(
        &self,
        ctx: &ExecutionContext,
        state: &ContractState,
    ) -> Result<ContractOutput, ContractError> {
        let payload: AssignmentPayload = ctx.payload()?;
        let recipient = payload
            .recipient_public_key
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                ContractError::InvalidPayload("missing recipientPublicKey".to_string())
            })?;
        // The first assignment is final.
        if state.contains_key(&recipient_key(&payload.shipment_id)) {
            return Err(ContractError::Rejected(format!(
                "shipment {} already has a recipient",
                payload.shipment_id
            )));
        }
        Ok(ContractOutput::new()
            .with_output(format!("recipient assigned to shipment {}", payload.shipment_id))
            .set(recipient_key(&payload.shipment_id), recipient.as_str())
            .emit(
                "RecipientAssigned",
                [
                    ("shipmentId", ContractValue::from(payload.shipment_id.as_str())),
                    ("recipientPublicKey", ContractValue::from(recipient)),
                ],
            ))
    }

    fn confirm(
        &self,
        ctx: &ExecutionContext,
        state: &ContractState,
    ) -> Result<ContractOutput, ContractError> {
        let payload: ConfirmationPayload = ctx.payload()?;
        let shipment = payload.shipment_id.as_str();

        let recipient = state
            .get(&recipient_key(shipment))
            .and_then(ContractValue::as_str)
            .ok_or_else(|| {
                ContractError::Rejected(format!("no recipient assigned to shipment {}", shipment))
            })?;
        if state
            .get(&confirmed_key(shipment))
            .and_then(ContractValue::as_bool)
            .unwrap_or(false)
        {
            return Err(ContractError::Rejected(format!(
                "delivery of shipment {} already confirmed",
                shipment
            )));
        }
        if ctx.transaction.sender_public_key != recipient {
            return Err(ContractError::Unauthorized(format!(
                "only the assigned recipient may confirm shipment {}",
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

        Ok(ContractOutput::new()
            .with_output(format!("delivery of shipment {} confirmed", shipment))
            .set(confirmed_key(shipment), true)
            .set(format!("shipment:{}:confirmedAt", shipment), ctx.executed_at)
            .emit(
                "DeliveryConfirmed",
                [
                    ("shipmentId", ContractValue::from(shipment)),
                    ("confirmedBy", ContractValue::from(recipient)),
                    ("confirmedAt", ContractValue::from(ctx.executed_at)),
                ],
            ))
    }
}

impl SmartContract for DeliveryConfirmationContract {
    fn id(&self) -> &str {
        DELIVERY_CONFIRMATION_CONTRACT_ID
    }

    fn name(&self) -> &str {
        "Delivery Confirmation"
    }

    fn can_execute(&self, ctx: &ExecutionContext) -> bool {
        match ctx.transaction.tx_type {
            TransactionType::DeliveryConfirmed => true,
            // only shipments that name a recipient are tracked here
            TransactionType::ShipmentCreated => ctx
                .payload::<AssignmentPayload>()
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
            TransactionType::ShipmentCreated => self.assign(ctx, state),
            TransactionType::DeliveryConfirmed => self.confirm(ctx, state),
            other => Err(ContractError::Rejected(format!(
                "unsupported transaction type {}",
                other
            ))),
        }
    }
}
