//! The packet substrate abstraction (spec.md §4.1, component A).
//!
//! A narrow capability set — bind, address, send_to, recv_from, close — is
//! the crate's sole extension point onto the network (spec.md §9 "Design
//! Notes"). Addresses are opaque `String`s; nothing upstream of this module
//! is allowed to know whether they came from a socket or an in-memory map.

pub mod memory;
pub mod udp;

use crate::error::UcpError;

/// A pluggable duplex datagram endpoint.
///
/// Implementations must be non-blocking and must preserve datagram
/// boundaries. They need not deliver in order and need not deliver at all —
/// the reliability engine above this layer compensates for both.
pub trait PacketSubstrate: Send + Sync {
    /// Bind to `address`. An empty string means "pick any free address".
    /// Fails if the address is already in use or malformed.
    fn bind(&self, address: &str) -> Result<(), UcpError>;

    /// The address this substrate is bound to, or `""` before `bind`.
    fn address(&self) -> String;

    /// Send `buf` to `to`. Returns the number of bytes accepted, or an
    /// error on substrate failure or when `to` names this same endpoint.
    fn send_to(&self, buf: &[u8], to: &str) -> Result<usize, UcpError>;

    /// Non-blocking receive. `Ok(None)` means no datagram is currently
    /// available; must not block longer than one tick.
    fn recv_from(&self, buf: &mut [u8]) -> Result<Option<(usize, String)>, UcpError>;

    /// Idempotent close.
    fn close(&self);
}
