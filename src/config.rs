//! Constants and overridable parameters from spec.md §6.
//!
//! The numeric values here are fixed by the specification and must not
//! change; [`Parameters`] exists only so integration tests can shrink
//! timeouts (spec.md §8 scenarios C and E would otherwise need a real
//! 3 s/30 s wall-clock wait) without touching the production defaults that
//! `Parameters::default()` returns.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// The cadence at which `Client` and `Server` monitor loops poll the
/// substrate and service timers.
pub const TICK_INTERVAL: Duration = Duration::from_millis(10);

/// Hard deadline for a client handshake (`Init` -> `Connected`).
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(3000);

/// How often an idle client must emit a `Heartbeat` so the server doesn't
/// evict it.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(10_000);

/// How long the server tolerates silence from a peer before evicting it.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Maximum payload bytes carried by one `Data` envelope.
pub const MAX_PAYLOAD_SIZE: usize = 1024;

/// Size of a control envelope on the wire: 1 (type) + 4 (session_id) + 4
/// (payload_size) + 1024 (payload).
pub const ENVELOPE_SIZE: usize = 1 + 4 + 4 + MAX_PAYLOAD_SIZE;

/// Reliability-engine dials fixed by spec.md §4.2 / §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineParameters {
    pub nodelay: bool,
    pub interval_ms: u32,
    pub resend_threshold: u32,
    pub no_cwnd: bool,
    pub send_window: u32,
    pub recv_window: u32,
    pub mtu: usize,
}

impl Default for EngineParameters {
    fn default() -> Self {
        Self {
            nodelay: true,
            interval_ms: 10,
            resend_threshold: 2,
            no_cwnd: true,
            send_window: 128,
            recv_window: 128,
            mtu: 1400,
        }
    }
}

/// Every timing/sizing knob a `Client` or `Server` needs, bundled so tests
/// can override the slow ones (handshake/heartbeat timeouts) while leaving
/// everything else at spec defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Parameters {
    pub tick_interval: Duration,
    pub handshake_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub engine: EngineParameters,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            tick_interval: TICK_INTERVAL,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            heartbeat_timeout: HEARTBEAT_TIMEOUT,
            engine: EngineParameters::default(),
        }
    }
}

/// The reliability engine's clock: low 32 bits of wall-clock milliseconds
/// (spec.md §4.2). Wraps every ~49.7 days; the engine's timeout math uses
/// wrapping arithmetic so this is harmless.
pub fn now_ms() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u32
}
