use crate::{AccountId, PositionId, TradeId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Kind of append-only audit event.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeEventKind {
    OrderPlaced,
    OrderFilled,
    OrderCancelled,
    PositionOpened,
    PositionClosed,
    TpSet,
    TpModified,
    TpTriggered,
    SlSet,
    SlModified,
    SlTriggered,
    LiquidationWarning,
    LiquidationTriggered,
    DailyReset,
    FundingApplied,
    AdminBreach,
}

/// Append-only audit row.
///
/// `event_hash` is the hex-encoded SHA-256 digest over the canonical JSON of a fixed field
/// set (see [`TradeEvent::compute_hash`]), letting downstream consumers verify the audit
/// trail was not rewritten.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TradeEvent {
    pub id: Uuid,
    pub account_id: AccountId,
    pub kind: TradeEventKind,
    pub position_id: Option<PositionId>,
    pub trade_id: Option<TradeId>,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub event_hash: String,
}

/// Canonical hashed field set. Field order is part of the canonical form; do not reorder.
#[derive(Serialize)]
struct HashedFields<'a> {
    account_id: &'a AccountId,
    kind: &'a TradeEventKind,
    position_id: &'a Option<PositionId>,
    trade_id: &'a Option<TradeId>,
    details: &'a serde_json::Value,
    created_at: &'a DateTime<Utc>,
}

impl TradeEvent {
    /// Construct a new [`TradeEvent`], computing its canonical hash.
    pub fn new(
        account_id: AccountId,
        kind: TradeEventKind,
        position_id: Option<PositionId>,
        trade_id: Option<TradeId>,
        details: serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> Self {
        let event_hash =
            Self::compute_hash(&account_id, &kind, &position_id, &trade_id, &details, &created_at);

        Self {
            id: Uuid::new_v4(),
            account_id,
            kind,
            position_id,
            trade_id,
            details,
            created_at,
            event_hash,
        }
    }

    /// Hex-encoded SHA-256 over the canonical JSON of the hashed field set.
    pub fn compute_hash(
        account_id: &AccountId,
        kind: &TradeEventKind,
        position_id: &Option<PositionId>,
        trade_id: &Option<TradeId>,
        details: &serde_json::Value,
        created_at: &DateTime<Utc>,
    ) -> String {
        let fields = HashedFields {
            account_id,
            kind,
            position_id,
            trade_id,
            details,
            created_at,
        };

        // Struct field order fixes the canonical JSON form
        let canonical = serde_json::to_string(&fields)
            .expect("TradeEvent canonical fields are always serialisable");

        let digest = Sha256::digest(canonical.as_bytes());
        hex::encode(digest)
    }

    /// Re-derive the hash from the row's fields and compare against the stored value.
    pub fn verify_hash(&self) -> bool {
        Self::compute_hash(
            &self.account_id,
            &self.kind,
            &self.position_id,
            &self.trade_id,
            &self.details,
            &self.created_at,
        ) == self.event_hash
    }
}
