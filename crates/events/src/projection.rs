use crate::EventEnvelope;

/// A projection builds a read model from an append-only event stream.
///
/// Projections implement the CQRS read side: they transform events (write
/// model) into queryable state (read model). Read models are **disposable**:
/// they can be deleted and rebuilt from the event stream at any time, since
/// events are the source of truth.
///
/// Projections must be **idempotent**: applying the same event twice must
/// produce the same result. The bus only guarantees at-least-once delivery,
/// so implementations typically track per-stream sequence numbers and skip
/// anything already processed.
///
/// `M` is the envelope payload as it travels over the bus (usually
/// `serde_json::Value`); projections deserialize into their own typed events.
/// Implementations use interior mutability so a shared projection can sit
/// behind an `Arc` on a subscriber thread.
pub trait Projection<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    /// Apply a single envelope to the projection, updating the read model.
    ///
    /// Envelopes for streams the projection does not care about must be
    /// ignored (return `Ok(())`), so one bus can feed many projections.
    fn apply_envelope(&self, envelope: &EventEnvelope<M>) -> Result<(), Self::Error>;
}
