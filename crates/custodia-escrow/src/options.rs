//! Inputs and outputs of the public escrow operations

use custodia_types::{
    ensure_positive, Currency, DisputeResolutionKind, EscrowError, EscrowId,
    EscrowStatus, EscrowTransactionId, EscrowType, Result, UserId,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEscrowRequest {
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub amount: Decimal,
    pub currency: Currency,
    #[serde(default)]
    pub description: String,
    /// Registered processor to use; the registry default when absent
    pub processor_name: Option<String>,
    pub payment_method_id: String,
    pub release_conditions: Option<Value>,
    /// Falls back to the configured default expiry
    pub expiry_days: Option<u32>,
    #[serde(default)]
    pub escrow_type: EscrowType,
    #[serde(default)]
    pub metadata: Value,
}

impl CreateEscrowRequest {
    pub fn validate(&self) -> Result<()> {
        ensure_positive(self.amount, "amount")?;

        if self.sender_id.as_str().is_empty() || self.recipient_id.as_str().is_empty() {
            return Err(EscrowError::validation("senderId and recipientId are required"));
        }
        if self.sender_id == self.recipient_id {
            return Err(EscrowError::validation(
                "sender and recipient must be different users",
            ));
        }
        if self.payment_method_id.trim().is_empty() {
            return Err(EscrowError::validation("paymentMethodId is required"));
        }
        if self.expiry_days == Some(0) {
            return Err(EscrowError::validation("expiryDays must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEscrowResponse {
    pub escrow_id: EscrowId,
    pub escrow_transaction_id: EscrowTransactionId,
    pub processor: String,
    pub redirect_url: Option<String>,
    pub client_secret: Option<String>,
    pub status: EscrowStatus,
    pub amount: Decimal,
    pub currency: Currency,
}

/// Every mutating operation accepts a caller idempotency key. A repeated key
/// for the same operation returns the already committed record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FundOptions {
    pub funded_by: Option<UserId>,
    /// Overrides the payment method given at creation
    pub payment_method_id: Option<String>,
    /// Processor-specific funding options
    pub options: Value,
    pub note: Option<String>,
    pub metadata: Option<Value>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReleaseOptions {
    pub released_by: Option<UserId>,
    /// Whole remaining balance when absent
    pub release_amount: Option<Decimal>,
    pub note: Option<String>,
    pub metadata: Option<Value>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CancelOptions {
    pub cancelled_by: Option<UserId>,
    pub reason: Option<String>,
    pub metadata: Option<Value>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpenDisputeOptions {
    pub opened_by: UserId,
    pub dispute_reason: String,
    pub evidence: Vec<String>,
    pub metadata: Option<Value>,
    pub idempotency_key: Option<String>,
}

impl OpenDisputeOptions {
    pub fn new(opened_by: impl Into<UserId>, dispute_reason: impl Into<String>) -> Self {
        Self {
            opened_by: opened_by.into(),
            dispute_reason: dispute_reason.into(),
            evidence: Vec::new(),
            metadata: None,
            idempotency_key: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolveDisputeOptions {
    pub resolved_by: Option<UserId>,
    pub resolution: DisputeResolutionKind,
    /// Required for, and only read by, split resolutions
    pub split_ratio: Option<Decimal>,
    pub note: Option<String>,
    pub metadata: Option<Value>,
    pub idempotency_key: Option<String>,
}

impl ResolveDisputeOptions {
    pub fn new(resolution: DisputeResolutionKind) -> Self {
        Self {
            resolved_by: None,
            resolution,
            split_ratio: None,
            note: None,
            metadata: None,
            idempotency_key: None,
        }
    }

    pub fn split(ratio: Decimal) -> Self {
        Self {
            split_ratio: Some(ratio),
            ..Self::new(DisputeResolutionKind::Split)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn request() -> CreateEscrowRequest {
        CreateEscrowRequest {
            sender_id: UserId::from("alice"),
            recipient_id: UserId::from("bob"),
            amount: dec!(200),
            currency: Currency::usd(),
            description: "logo design".to_string(),
            processor_name: None,
            payment_method_id: "pm_card_visa".to_string(),
            release_conditions: None,
            expiry_days: None,
            escrow_type: EscrowType::Standard,
            metadata: Value::Null,
        }
    }

    #[test]
    fn test_valid_request() {
        assert!(request().validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_requests() {
        let mut zero = request();
        zero.amount = Decimal::ZERO;

        let mut same_party = request();
        same_party.recipient_id = UserId::from("alice");

        let mut no_method = request();
        no_method.payment_method_id = " ".to_string();

        let mut no_expiry = request();
        no_expiry.expiry_days = Some(0);

        for bad in [zero, same_party, no_method, no_expiry] {
            assert!(matches!(bad.validate(), Err(EscrowError::Validation { .. })));
        }
    }

    #[test]
    fn test_request_deserializes_camel_case() {
        let request: CreateEscrowRequest = serde_json::from_value(serde_json::json!({
            "senderId": "alice",
            "recipientId": "bob",
            "amount": "150.00",
            "currency": "eur",
            "paymentMethodId": "pm_sepa",
            "expiryDays": 7,
            "escrowType": "milestone"
        }))
        .unwrap();

        assert_eq!(request.currency, Currency::eur());
        assert_eq!(request.escrow_type, EscrowType::Milestone);
        assert_eq!(request.expiry_days, Some(7));
    }
}
