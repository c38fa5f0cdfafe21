use crate::envelope::{Envelope, Recipient, SendOptions};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dirigent_core::{DirigentError, DirigentResult, EntityKind};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

/// A registered message recipient.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// The addressable id this handler answers to.
    fn name(&self) -> &str;
    /// Handle one delivered envelope.
    async fn handle(&self, envelope: &Envelope) -> DirigentResult<()>;
}

/// A require-ack envelope awaiting acknowledgement or expiry.
struct PendingAck {
    deadline: DateTime<Utc>,
    ttl_ms: u64,
    acked: bool,
    /// Present for correlated requests; resolved by [`MessageRouter::respond`].
    responder: Option<oneshot::Sender<serde_json::Value>>,
}

/// Delivers envelopes between registered handlers.
///
/// Delivery to multiple targets is isolated per target: one failing handler
/// is logged and skipped, never aborting delivery to its siblings or failing
/// the overall send. The in-process handler invocation is an implementation
/// detail — the send/ack/timeout contract is what an out-of-process
/// transport would have to preserve.
pub struct MessageRouter {
    handlers: RwLock<HashMap<String, Arc<dyn MessageHandler>>>,
    pending: RwLock<HashMap<Uuid, PendingAck>>,
}

impl MessageRouter {
    /// Create a router with no handlers.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            pending: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler under its own name, replacing any previous one.
    pub async fn register_handler(&self, handler: Arc<dyn MessageHandler>) {
        let name = handler.name().to_string();
        self.handlers.write().await.insert(name, handler);
    }

    /// Remove a handler by name.
    pub async fn deregister_handler(&self, name: &str) -> bool {
        self.handlers.write().await.remove(name).is_some()
    }

    /// Number of registered handlers.
    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }

    /// Names of all registered handlers, ascending.
    pub async fn handler_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of envelopes currently awaiting acknowledgement.
    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }

    /// Send an envelope.
    ///
    /// Resolves the recipient into a target set (a single worker must be
    /// registered; council is everyone; broadcast is everyone but the
    /// sender), invokes each target's handler, and records the envelope in
    /// the pending table when `require_ack` is set. The returned envelope's
    /// `hops` list the targets that accepted delivery.
    pub async fn send(
        &self,
        from: &str,
        to: Recipient,
        kind: &str,
        content: serde_json::Value,
        opts: SendOptions,
    ) -> DirigentResult<Envelope> {
        let envelope = Envelope::new(from, to, kind, content, &opts);
        self.dispatch(envelope, None).await
    }

    /// Resolve targets, register the pending entry, and deliver.
    ///
    /// The pending entry (with its responder, when given) is registered
    /// before the first handler runs, so a recipient that answers from
    /// inside `handle` cannot race the caller's await.
    pub(crate) async fn dispatch(
        &self,
        mut envelope: Envelope,
        responder: Option<oneshot::Sender<serde_json::Value>>,
    ) -> DirigentResult<Envelope> {
        // Read phase: resolve targets to owned handles so no lock is held
        // across handler awaits.
        let targets: Vec<(String, Arc<dyn MessageHandler>)> = {
            let handlers = self.handlers.read().await;
            match &envelope.to {
                Recipient::Worker(id) => {
                    let handler =
                        handlers
                            .get(id)
                            .cloned()
                            .ok_or_else(|| DirigentError::UnknownEntity {
                                kind: EntityKind::Worker,
                                id: id.clone(),
                            })?;
                    vec![(id.clone(), handler)]
                }
                Recipient::Council => {
                    let mut all: Vec<_> = handlers
                        .iter()
                        .map(|(name, h)| (name.clone(), h.clone()))
                        .collect();
                    all.sort_by(|a, b| a.0.cmp(&b.0));
                    all
                }
                Recipient::Broadcast => {
                    let mut all: Vec<_> = handlers
                        .iter()
                        .filter(|(name, _)| name.as_str() != envelope.from)
                        .map(|(name, h)| (name.clone(), h.clone()))
                        .collect();
                    all.sort_by(|a, b| a.0.cmp(&b.0));
                    all
                }
            }
        };

        if envelope.require_ack {
            self.pending.write().await.insert(
                envelope.id,
                PendingAck {
                    deadline: envelope.sent_at
                        + chrono::Duration::milliseconds(envelope.ttl_ms as i64),
                    ttl_ms: envelope.ttl_ms,
                    acked: false,
                    responder,
                },
            );
        }

        for (name, handler) in targets {
            match handler.handle(&envelope).await {
                Ok(()) => envelope.hops.push(name),
                Err(e) => {
                    warn!(envelope = %envelope.id, recipient = %name, error = %e,
                        "delivery failed, continuing with remaining targets");
                }
            }
        }

        debug!(envelope = %envelope.id, kind = %envelope.kind,
            delivered = envelope.hops.len(), "envelope sent");
        Ok(envelope)
    }

    /// Acknowledge a pending envelope.
    ///
    /// Ack-only envelopes are released immediately; a correlated request
    /// stays pending until [`respond`](Self::respond) or expiry so the
    /// caller's await is not dropped by a bare ack.
    pub async fn acknowledge(&self, envelope_id: Uuid) -> DirigentResult<()> {
        let mut pending = self.pending.write().await;
        let entry = pending
            .get_mut(&envelope_id)
            .ok_or_else(|| DirigentError::UnknownEntity {
                kind: EntityKind::Envelope,
                id: envelope_id.to_string(),
            })?;
        entry.acked = true;
        if entry.responder.is_none() {
            pending.remove(&envelope_id);
        }
        Ok(())
    }

    /// Resolve a correlated request with its response value.
    pub async fn respond(
        &self,
        correlation_id: Uuid,
        value: serde_json::Value,
    ) -> DirigentResult<()> {
        let mut pending = self.pending.write().await;
        let has_responder = pending
            .get(&correlation_id)
            .is_some_and(|entry| entry.responder.is_some());
        if !has_responder {
            return Err(DirigentError::UnknownEntity {
                kind: EntityKind::Envelope,
                id: correlation_id.to_string(),
            });
        }
        if let Some(entry) = pending.remove(&correlation_id) {
            if let Some(tx) = entry.responder {
                // The caller may have timed out and dropped the receiver.
                let _ = tx.send(value);
            }
        }
        Ok(())
    }

    /// Drop a pending entry (request gave up or failed to deliver).
    pub(crate) async fn forget(&self, envelope_id: Uuid) {
        self.pending.write().await.remove(&envelope_id);
    }

    /// Expire every pending envelope past its deadline. Returns the number
    /// expired. Dropping a responder wakes its waiting caller with a
    /// timeout.
    pub async fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut pending = self.pending.write().await;
        let expired: Vec<Uuid> = pending
            .iter()
            .filter(|(_, entry)| now >= entry.deadline)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            if let Some(entry) = pending.remove(id) {
                warn!(envelope = %id, acked = entry.acked, ttl_ms = entry.ttl_ms,
                    "pending envelope expired");
            }
        }
        expired.len()
    }

    /// Spawn the periodic expiry sweep.
    ///
    /// Returns the [`tokio::task::JoinHandle`] so the caller can abort or
    /// await it.
    pub fn start_ttl_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let expired = router.sweep_expired().await;
                if expired > 0 {
                    debug!(expired, "ttl sweep released envelopes");
                }
            }
        })
    }
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::new()
    }
}
