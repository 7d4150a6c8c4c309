//! The application-facing session handle (spec.md §4.3, component D).
//!
//! A `Session` is a thin, cheaply-cloned front onto state shared with the
//! owning `Client` monitor thread or `Server` registry entry — spec.md §9
//! calls for "registry-authoritative lifecycle": eviction must not dangle
//! an application's handle, so every operation after eviction degrades to
//! the same `Err`/`None` an application already has to handle for a live
//! but disconnected session, rather than panicking or blocking forever.
//! `Arc<Mutex<SessionInner>>` gives us exactly that for free.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::engine::ReliabilityEngine;
use crate::error::UcpError;

/// Connection lifecycle state, spec.md §3. Shared by client sessions and
/// server connections; `Listen` only ever applies to a `Server` itself; a
/// `Session` is never observed in `Listen`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Init,
    Handshake,
    Listen,
    Connected,
    Closed,
    Exit,
}

impl Status {
    pub fn name(self) -> &'static str {
        match self {
            Status::Init => "Init",
            Status::Handshake => "Handshake",
            Status::Listen => "Listen",
            Status::Connected => "Connected",
            Status::Closed => "Closed",
            Status::Exit => "Exit",
        }
    }
}

/// Which endpoint this `Session` handle represents — determines what
/// `address()` reports, per spec.md §4.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Client,
    Server,
}

pub(crate) struct SessionInner {
    pub status: Status,
    pub session_id: u32,
    pub local_address: String,
    pub remote_address: String,
    pub last_heartbeat_time: Instant,
    pub engine: Box<dyn ReliabilityEngine>,
}

impl SessionInner {
    pub(crate) fn new(
        session_id: u32,
        local_address: String,
        remote_address: String,
        status: Status,
        engine: Box<dyn ReliabilityEngine>,
    ) -> Self {
        Self {
            status,
            session_id,
            local_address,
            remote_address,
            last_heartbeat_time: Instant::now(),
            engine,
        }
    }
}

/// A shared handle to a reliable, ordered, bidirectional message channel.
///
/// Cloning a `Session` does not duplicate the channel: all clones observe
/// the same status and the same message stream. This is what lets a
/// `Server`'s registry and the application both hold "the same" session —
/// spec.md §3 "the registry is the sole owner... Sessions handed to the
/// application are shared references".
#[derive(Clone)]
pub struct Session {
    pub(crate) inner: Arc<Mutex<SessionInner>>,
    pub(crate) side: Side,
}

impl Session {
    pub(crate) fn new(inner: Arc<Mutex<SessionInner>>, side: Side) -> Self {
        Self { inner, side }
    }

    /// Enqueue `data` for reliable, ordered delivery. All-or-nothing: on
    /// success, returns `data.len()`. Fails if this session is not
    /// `Connected`.
    pub fn send(&self, data: &[u8]) -> Result<usize, UcpError> {
        let mut guard = self.inner.lock().unwrap();
        if guard.status != Status::Connected {
            return Err(UcpError::StateViolation {
                status: guard.status.name(),
            });
        }
        guard.engine.send(data)?;
        Ok(data.len())
    }

    /// Dequeue the next fully-received message, if any.
    ///
    /// `Ok(None)` means "nothing yet" (spec.md §4.3's `0`); `Err` means
    /// this session is not `Connected` (spec.md §4.3's `-1`). Never
    /// partially delivers a message.
    pub fn recv(&self) -> Result<Option<Vec<u8>>, UcpError> {
        let mut guard = self.inner.lock().unwrap();
        if guard.status != Status::Connected {
            return Err(UcpError::StateViolation {
                status: guard.status.name(),
            });
        }
        Ok(guard.engine.recv())
    }

    /// From `Connected`: signal a close to the peer and transition to
    /// `Closed` (the owning monitor thread flushes a `CloseSession`
    /// envelope on its next tick and advances to `Exit`). Idempotent from
    /// any other state.
    pub fn close(&self) {
        let mut guard = self.inner.lock().unwrap();
        if guard.status == Status::Connected {
            guard.status = Status::Closed;
        }
    }

    /// Peer address for a server-side session; local bound address for a
    /// client-side session (spec.md §4.3).
    pub fn address(&self) -> String {
        let guard = self.inner.lock().unwrap();
        match self.side {
            Side::Server => guard.remote_address.clone(),
            Side::Client => guard.local_address.clone(),
        }
    }

    pub fn status(&self) -> Status {
        self.inner.lock().unwrap().status
    }

    pub fn session_id(&self) -> u32 {
        self.inner.lock().unwrap().session_id
    }

    /// Raw access to the shared state, for the `Client`/`Server` monitor
    /// threads that drive the engine and status transitions this handle's
    /// public API deliberately doesn't expose.
    pub(crate) fn lock(&self) -> std::sync::MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap()
    }

    pub(crate) fn side(&self) -> Side {
        self.side
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineParameters;
    use crate::engine::WindowEngine;

    fn test_session(status: Status, side: Side) -> Session {
        let inner = SessionInner::new(
            7,
            "local".to_string(),
            "remote".to_string(),
            status,
            Box::new(WindowEngine::new(EngineParameters::default())),
        );
        Session::new(Arc::new(Mutex::new(inner)), side)
    }

    #[test]
    fn send_and_recv_fail_outside_connected() {
        let s = test_session(Status::Handshake, Side::Client);
        assert!(s.send(b"x").is_err());
        assert!(s.recv().is_err());
    }

    #[test]
    fn recv_returns_none_when_queue_empty() {
        let s = test_session(Status::Connected, Side::Client);
        assert_eq!(s.recv().unwrap(), None);
    }

    #[test]
    fn close_is_idempotent() {
        let s = test_session(Status::Connected, Side::Server);
        s.close();
        assert_eq!(s.status(), Status::Closed);
        s.close();
        assert_eq!(s.status(), Status::Closed);
    }

    #[test]
    fn address_depends_on_side() {
        let client_side = test_session(Status::Connected, Side::Client);
        assert_eq!(client_side.address(), "local");
        let server_side = test_session(Status::Connected, Side::Server);
        assert_eq!(server_side.address(), "remote");
    }

    #[test]
    fn clones_observe_the_same_state() {
        let s = test_session(Status::Connected, Side::Client);
        let clone = s.clone();
        clone.close();
        assert_eq!(s.status(), Status::Closed);
    }
}
