use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use uuid::Uuid;

/// A single line on an order.
///
/// Only `id` and `qty` are read here. Modifiers, prices and anything else
/// the till attaches ride along in `extra` and reach the server unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: String,
    /// Whole or fractional quantity, e.g. `0.5` for a weighed item.
    pub qty: Number,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl OrderItem {
    pub fn new(id: impl Into<String>, qty: impl Into<Number>) -> Self {
        Self {
            id: id.into(),
            qty: qty.into(),
            extra: Map::new(),
        }
    }
}

/// The order-creation request as entered at the till.
///
/// Opaque to the queue: fields not named here are kept in `extra` and
/// serialized back next to the known ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPayload {
    pub table_id: String,
    pub items: Vec<OrderItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl OrderPayload {
    pub fn new(table_id: impl Into<String>, items: Vec<OrderItem>) -> Self {
        Self {
            table_id: table_id.into(),
            items,
            notes: None,
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Syncing,
    Synced,
    Failed,
}

/// Why a record left the retry cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    RetriesExhausted { last_error: String },
    Rejected { status: u16, message: String },
}

/// Optimistic local record of an order that has not been confirmed yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingOrder {
    /// Idempotency key. Stays the same across every retry of this order.
    pub local_id: String,
    pub payload: OrderPayload,
    pub status: SyncStatus,
    pub created_at_ms: u64,
    pub retry_count: u32,
    pub server_id: Option<String>,
    /// Earliest time the next submission may be attempted.
    pub next_attempt_at_ms: u64,
    pub last_error: Option<String>,
    pub synced_at_ms: Option<u64>,
    pub failure: Option<FailureReason>,
}

impl PendingOrder {
    pub fn new(payload: OrderPayload, now_ms: u64) -> Self {
        Self {
            local_id: new_local_id(),
            payload,
            status: SyncStatus::Pending,
            created_at_ms: now_ms,
            retry_count: 0,
            server_id: None,
            next_attempt_at_ms: now_ms,
            last_error: None,
            synced_at_ms: None,
            failure: None,
        }
    }

    pub fn is_due(&self, now_ms: u64) -> bool {
        self.status == SyncStatus::Pending && self.next_attempt_at_ms <= now_ms
    }

    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.created_at_ms)
    }
}

/// Mints a fresh idempotency key.
pub fn new_local_id() -> String {
    format!("loc_{}", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> OrderPayload {
        OrderPayload::new("T5", vec![OrderItem::new("x", 2u32)])
    }

    #[test]
    fn new_order_starts_pending_and_due() {
        let order = PendingOrder::new(payload(), 1_000);
        assert_eq!(order.status, SyncStatus::Pending);
        assert_eq!(order.retry_count, 0);
        assert!(order.server_id.is_none());
        assert!(order.is_due(1_000));
        assert!(order.local_id.starts_with("loc_"));
    }

    #[test]
    fn local_ids_are_not_reused() {
        let a = PendingOrder::new(payload(), 0);
        let b = PendingOrder::new(payload(), 0);
        assert_ne!(a.local_id, b.local_id);
    }

    #[test]
    fn backoff_window_defers_due_time() {
        let mut order = PendingOrder::new(payload(), 1_000);
        order.next_attempt_at_ms = 5_000;
        assert!(!order.is_due(4_999));
        assert!(order.is_due(5_000));
        assert_eq!(order.age_ms(6_000), 5_000);
    }

    #[test]
    fn payload_accepts_minimal_json() {
        let parsed: OrderPayload =
            serde_json::from_str(r#"{"table_id":"T5","items":[{"id":"x","qty":2}]}"#).unwrap();
        assert_eq!(parsed, payload());
    }

    #[test]
    fn unknown_fields_and_fractional_quantities_survive() {
        let raw = serde_json::json!({
            "table_id": "T5",
            "items": [
                {"id": "x", "qty": 2, "modifiers": ["no onion"], "price": 4.5},
                {"id": "cheese", "qty": 0.5}
            ],
            "notes": "n",
            "guest_count": 3
        });
        let parsed: OrderPayload = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(parsed.items[1].qty.as_f64(), Some(0.5));
        assert_eq!(parsed.extra["guest_count"], 3);
        assert_eq!(serde_json::to_value(&parsed).unwrap(), raw);
    }
}
