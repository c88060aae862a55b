//! Escrow request bodies
//!
//! Bodies are camelCase JSON. Field shape is checked here; amounts, ratios
//! and lifecycle rules are left to the engine so both surfaces agree.

use chrono::{DateTime, Utc};
use custodia_escrow::{
    CancelOptions, CreateEscrowRequest, FundOptions, OpenDisputeOptions, ReleaseOptions,
    ResolveDisputeOptions, UserEscrowFilter,
};
use custodia_types::{Currency, DisputeResolutionKind, EscrowStatus, EscrowType, UserId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use validator::Validate;

use crate::error::ApiResult;

fn user(id: Option<String>) -> Option<UserId> {
    id.map(UserId)
}

// =============================================================================
// Create
// =============================================================================

/// Create escrow request
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateEscrowBody {
    #[validate(length(min = 1, message = "is required"))]
    pub sender_id: String,
    #[validate(length(min = 1, message = "is required"))]
    pub recipient_id: String,
    pub amount: Decimal,
    #[validate(length(equal = 3, message = "must be a three-letter code"))]
    pub currency: String,
    pub description: Option<String>,
    pub processor_name: Option<String>,
    #[validate(length(min = 1, message = "is required"))]
    pub payment_method_id: String,
    pub release_conditions: Option<Value>,
    #[validate(range(min = 1, message = "must be at least 1"))]
    pub expiry_days: Option<u32>,
    pub escrow_type: Option<EscrowType>,
    pub metadata: Option<Value>,
}

impl CreateEscrowBody {
    pub fn into_request(self) -> ApiResult<CreateEscrowRequest> {
        Ok(CreateEscrowRequest {
            sender_id: UserId(self.sender_id),
            recipient_id: UserId(self.recipient_id),
            amount: self.amount,
            currency: Currency::new(&self.currency)?,
            description: self.description.unwrap_or_default(),
            processor_name: self.processor_name,
            payment_method_id: self.payment_method_id,
            release_conditions: self.release_conditions,
            expiry_days: self.expiry_days,
            escrow_type: self.escrow_type.unwrap_or_default(),
            metadata: self.metadata.unwrap_or(Value::Null),
        })
    }
}

// =============================================================================
// Lifecycle transitions
// =============================================================================

/// Fund escrow request
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct FundEscrowBody {
    pub funded_by: Option<String>,
    #[validate(length(min = 1, message = "must not be empty"))]
    pub payment_method_id: Option<String>,
    pub options: Option<Value>,
    pub note: Option<String>,
    pub metadata: Option<Value>,
    #[validate(length(min = 1, max = 255, message = "must be 1 to 255 characters"))]
    pub idempotency_key: Option<String>,
}

impl From<FundEscrowBody> for FundOptions {
    fn from(body: FundEscrowBody) -> Self {
        Self {
            funded_by: user(body.funded_by),
            payment_method_id: body.payment_method_id,
            options: body.options.unwrap_or(Value::Null),
            note: body.note,
            metadata: body.metadata,
            idempotency_key: body.idempotency_key,
        }
    }
}

/// Release escrow request
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseEscrowBody {
    pub released_by: Option<String>,
    /// Whole remaining balance when absent
    pub release_amount: Option<Decimal>,
    pub note: Option<String>,
    pub metadata: Option<Value>,
    #[validate(length(min = 1, max = 255, message = "must be 1 to 255 characters"))]
    pub idempotency_key: Option<String>,
}

impl From<ReleaseEscrowBody> for ReleaseOptions {
    fn from(body: ReleaseEscrowBody) -> Self {
        Self {
            released_by: user(body.released_by),
            release_amount: body.release_amount,
            note: body.note,
            metadata: body.metadata,
            idempotency_key: body.idempotency_key,
        }
    }
}

/// Cancel escrow request
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CancelEscrowBody {
    pub cancelled_by: Option<String>,
    pub reason: Option<String>,
    pub metadata: Option<Value>,
    #[validate(length(min = 1, max = 255, message = "must be 1 to 255 characters"))]
    pub idempotency_key: Option<String>,
}

impl From<CancelEscrowBody> for CancelOptions {
    fn from(body: CancelEscrowBody) -> Self {
        Self {
            cancelled_by: user(body.cancelled_by),
            reason: body.reason,
            metadata: body.metadata,
            idempotency_key: body.idempotency_key,
        }
    }
}

// =============================================================================
// Disputes
// =============================================================================

/// Open dispute request
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct OpenDisputeBody {
    #[validate(length(min = 1, message = "is required"))]
    pub opened_by: String,
    #[validate(length(min = 1, message = "is required"))]
    pub dispute_reason: String,
    #[serde(default)]
    pub evidence: Vec<String>,
    pub metadata: Option<Value>,
    #[validate(length(min = 1, max = 255, message = "must be 1 to 255 characters"))]
    pub idempotency_key: Option<String>,
}

impl From<OpenDisputeBody> for OpenDisputeOptions {
    fn from(body: OpenDisputeBody) -> Self {
        Self {
            opened_by: UserId(body.opened_by),
            dispute_reason: body.dispute_reason,
            evidence: body.evidence,
            metadata: body.metadata,
            idempotency_key: body.idempotency_key,
        }
    }
}

/// Resolve dispute request
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ResolveDisputeBody {
    pub resolved_by: Option<String>,
    /// `release`, `refund` or `split`
    #[validate(length(min = 1, message = "is required"))]
    pub resolution: String,
    /// Required for `split`, strictly between 0 and 1
    pub split_ratio: Option<Decimal>,
    pub note: Option<String>,
    pub metadata: Option<Value>,
    #[validate(length(min = 1, max = 255, message = "must be 1 to 255 characters"))]
    pub idempotency_key: Option<String>,
}

impl ResolveDisputeBody {
    pub fn into_options(self) -> ApiResult<ResolveDisputeOptions> {
        let resolution: DisputeResolutionKind = self.resolution.parse()?;
        Ok(ResolveDisputeOptions {
            resolved_by: user(self.resolved_by),
            resolution,
            split_ratio: self.split_ratio,
            note: self.note,
            metadata: self.metadata,
            idempotency_key: self.idempotency_key,
        })
    }
}

// =============================================================================
// Queries
// =============================================================================

/// Query parameters for a user's escrows
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UserEscrowQuery {
    pub status: Option<String>,
    /// RFC 3339, inclusive
    pub start_date: Option<DateTime<Utc>>,
    /// RFC 3339, inclusive
    pub end_date: Option<DateTime<Utc>>,
    #[validate(range(min = 1, max = 500, message = "must be between 1 and 500"))]
    pub limit: Option<usize>,
}

impl UserEscrowQuery {
    pub fn into_filter(self) -> ApiResult<UserEscrowFilter> {
        let status = self
            .status
            .as_deref()
            .map(str::parse::<EscrowStatus>)
            .transpose()?;
        Ok(UserEscrowFilter {
            status,
            start_date: self.start_date,
            end_date: self.end_date,
            limit: self.limit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApiError;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_create_body_normalizes_currency() {
        let body: CreateEscrowBody = serde_json::from_value(json!({
            "senderId": "alice",
            "recipientId": "bob",
            "amount": "250.00",
            "currency": "usd",
            "paymentMethodId": "pm_card"
        }))
        .unwrap();
        assert!(body.validate().is_ok());

        let request = body.into_request().unwrap();
        assert_eq!(request.currency, Currency::usd());
        assert_eq!(request.amount, dec!(250.00));
        assert_eq!(request.escrow_type, EscrowType::Standard);
    }

    #[test]
    fn test_create_body_field_errors() {
        let body: CreateEscrowBody = serde_json::from_value(json!({
            "senderId": "",
            "recipientId": "bob",
            "amount": 10,
            "currency": "dollars",
            "paymentMethodId": "pm_card",
            "expiryDays": 0
        }))
        .unwrap();

        let err = ApiError::from(body.validate().unwrap_err());
        let message = err.to_string();
        assert!(message.contains("senderId") || message.contains("sender_id"));
        assert!(message.contains("currency"));
        assert!(message.contains("expiry"));
    }

    #[test]
    fn test_resolution_parsing() {
        let body: ResolveDisputeBody = serde_json::from_value(json!({
            "resolution": "split",
            "splitRatio": "0.25"
        }))
        .unwrap();
        let options = body.into_options().unwrap();
        assert_eq!(options.resolution, DisputeResolutionKind::Split);
        assert_eq!(options.split_ratio, Some(dec!(0.25)));

        let unknown: ResolveDisputeBody =
            serde_json::from_value(json!({ "resolution": "coin_flip" })).unwrap();
        assert!(matches!(unknown.into_options(), Err(ApiError::Escrow(_))));
    }

    #[test]
    fn test_query_parses_status() {
        let query = UserEscrowQuery {
            status: Some("partially_released".to_string()),
            ..Default::default()
        };
        let filter = query.into_filter().unwrap();
        assert_eq!(filter.status, Some(EscrowStatus::PartiallyReleased));

        let bad = UserEscrowQuery {
            status: Some("lost".to_string()),
            ..Default::default()
        };
        assert!(bad.into_filter().is_err());
    }
}
