//! Envelope routing between workers with acknowledgement and timeout.
//!
//! Delivers envelopes from a sender to a single worker, to every registered
//! handler ("council"), or to all-but-sender ("broadcast"); tracks
//! require-ack envelopes in a pending table bounded by TTL; and supports
//! correlated request/response with an explicit, opt-in retry policy.
//!
//! # Main types
//!
//! - [`MessageRouter`] — Registration, delivery, acknowledgement, RPC.
//! - [`MessageHandler`] — Trait a worker implements to receive envelopes.
//! - [`Envelope`] — One routed message with priority, TTL, and hop list.
//! - [`Recipient`] — Single worker, council, or broadcast addressing.
//! - [`RetryPolicy`] — Capped exponential backoff for correlated requests.

/// Envelope and addressing types.
pub mod envelope;
/// Correlated request/response with retry.
pub mod rpc;
/// Handler registration, delivery, and acknowledgement tracking.
pub mod router;

pub use envelope::{Envelope, Recipient, SendOptions};
pub use router::{MessageHandler, MessageRouter};
pub use rpc::RetryPolicy;
