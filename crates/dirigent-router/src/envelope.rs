use chrono::{DateTime, Utc};
use dirigent_core::Priority;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where an envelope is addressed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recipient {
    /// A single worker by id.
    Worker(String),
    /// Every registered handler, the sender included.
    Council,
    /// Every registered handler except the sender.
    Broadcast,
}

/// Per-send options. Defaults: normal priority, 30 s TTL, no ack required.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendOptions {
    /// Delivery priority.
    pub priority: Priority,
    /// Time-to-live in milliseconds for acknowledgement tracking.
    pub ttl_ms: u64,
    /// Whether the envelope is held pending until acknowledged.
    pub require_ack: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            priority: Priority::Normal,
            ttl_ms: 30_000,
            require_ack: false,
        }
    }
}

/// A routed message: one sender, one logical recipient, a typed JSON payload.
///
/// Require-ack envelopes are held in the router's pending table until
/// [`acknowledge`](crate::MessageRouter::acknowledge) is called or the TTL
/// elapses; everything else is fire-and-forget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique envelope id; doubles as the RPC correlation id.
    pub id: Uuid,
    /// Sender id.
    pub from: String,
    /// Logical recipient.
    pub to: Recipient,
    /// Payload type tag (e.g. `"delegation"`, `"rpc_request"`).
    pub kind: String,
    /// JSON payload, passed by value.
    pub content: serde_json::Value,
    /// Delivery priority.
    pub priority: Priority,
    /// Whether the envelope must be acknowledged.
    pub require_ack: bool,
    /// Set once [`acknowledge`](crate::MessageRouter::acknowledge) runs.
    pub acked: bool,
    /// Ids of handlers the envelope actually reached.
    pub hops: Vec<String>,
    /// When the envelope was sent.
    pub sent_at: DateTime<Utc>,
    /// Time-to-live in milliseconds.
    pub ttl_ms: u64,
}

impl Envelope {
    /// Build an unsent envelope.
    pub fn new(
        from: impl Into<String>,
        to: Recipient,
        kind: impl Into<String>,
        content: serde_json::Value,
        opts: &SendOptions,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            from: from.into(),
            to,
            kind: kind.into(),
            content,
            priority: opts.priority,
            require_ack: opts.require_ack,
            acked: false,
            hops: Vec::new(),
            sent_at: Utc::now(),
            ttl_ms: opts.ttl_ms,
        }
    }

    /// Whether the TTL has elapsed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.sent_at + chrono::Duration::milliseconds(self.ttl_ms as i64)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_defaults() {
        let env = Envelope::new(
            "planner",
            Recipient::Worker("scout".to_string()),
            "delegation",
            serde_json::json!({"step": 1}),
            &SendOptions::default(),
        );
        assert_eq!(env.priority, Priority::Normal);
        assert!(!env.require_ack);
        assert!(!env.acked);
        assert!(env.hops.is_empty());
    }

    #[test]
    fn test_expiry() {
        let mut env = Envelope::new(
            "planner",
            Recipient::Broadcast,
            "notice",
            serde_json::Value::Null,
            &SendOptions {
                ttl_ms: 1_000,
                ..SendOptions::default()
            },
        );
        assert!(!env.is_expired(env.sent_at));
        env.sent_at = Utc::now() - chrono::Duration::seconds(2);
        assert!(env.is_expired(Utc::now()));
    }

    #[test]
    fn test_recipient_serialization() {
        let json = serde_json::to_string(&Recipient::Worker("scout".to_string())).unwrap();
        assert!(json.contains("scout"));
        let parsed: Recipient = serde_json::from_str("\"broadcast\"").unwrap();
        assert_eq!(parsed, Recipient::Broadcast);
    }
}
