//! Error taxonomy for the session transport.
//!
//! spec.md §7: "errors are surfaced only via return codes at the API
//! boundary; internal transitions never throw." These types are the
//! *internal* vocabulary used to get there — every fallible internal
//! operation returns one of these, and the point where a `Session`,
//! `Client`, or `Server` method crosses into the public API collapses it
//! into the spec's `-1`/`false`/`None`.

use thiserror::Error;

/// The seven error kinds from spec.md §7, as a single enum.
#[derive(Debug, Error)]
pub enum UcpError {
    /// `send_to`/`recv_from` on the packet substrate failed unrecoverably.
    #[error("substrate failure on {address}: {source}")]
    SubstrateFailure {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// `connect` did not reach `Connected` within the handshake deadline.
    #[error("handshake to {remote} timed out after {elapsed_ms} ms")]
    HandshakeTimeout { remote: String, elapsed_ms: u64 },

    /// The server replied `RejectSession`.
    #[error("handshake to {remote} was rejected by the peer")]
    HandshakeReject { remote: String },

    /// The peer sent `CloseSession`.
    #[error("peer {remote} closed the session")]
    PeerClose { remote: String },

    /// The server evicted the connection after `kHeartbeatTimeout` of silence.
    #[error("session with {remote} timed out after {silent_ms} ms of silence")]
    LivenessTimeout { remote: String, silent_ms: u64 },

    /// Wrong size, unknown type, or unexpected source address.
    #[error("malformed envelope from {from}: {reason}")]
    MalformedEnvelope { from: String, reason: String },

    /// `send`/`recv`/`close` attempted outside the state that permits it.
    #[error("operation invalid in status {status}")]
    StateViolation { status: &'static str },

    /// The reliability engine rejected an operation (e.g. send window full).
    #[error("reliability engine rejected operation: {reason}")]
    EngineRejected { reason: String },

    /// Bind failed (address already in use, or malformed).
    #[error("failed to bind to {address}: {reason}")]
    BindFailed { address: String, reason: String },
}

impl UcpError {
    /// The spec.md §7 taxonomy name, for logging/matching without exposing
    /// the whole enum shape to callers that only want the category.
    pub fn kind(&self) -> &'static str {
        match self {
            UcpError::SubstrateFailure { .. } => "SubstrateFailure",
            UcpError::HandshakeTimeout { .. } => "HandshakeTimeout",
            UcpError::HandshakeReject { .. } => "HandshakeReject",
            UcpError::PeerClose { .. } => "PeerClose",
            UcpError::LivenessTimeout { .. } => "LivenessTimeout",
            UcpError::MalformedEnvelope { .. } => "MalformedEnvelope",
            UcpError::StateViolation { .. } => "StateViolation",
            UcpError::EngineRejected { .. } => "EngineRejected",
            UcpError::BindFailed { .. } => "BindFailed",
        }
    }
}
