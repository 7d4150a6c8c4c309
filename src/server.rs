//! Server demux/listener and liveness engine (spec.md §4.5–§4.6,
//! components F and G).
//!
//! One monitor thread owns the listening substrate socket for the whole
//! process lifetime of a `Listen`ing `Server`. Every tick it drains
//! inbound envelopes (dispatching by peer address and message type) and
//! then walks the registry doing maintenance: ticking each connection's
//! engine, flushing closes, and evicting connections silent past the
//! heartbeat timeout. `accept()` is a second, independent reader of the
//! same registry — it never touches the substrate directly, so it can
//! block (via cooperative tick sleep) on any thread without contending
//! with the monitor's socket ownership.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::config::{now_ms, Parameters, ENVELOPE_SIZE};
use crate::engine::{ReliabilityEngine, WindowEngine};
use crate::envelope::{Envelope, MessageType};
use crate::error::UcpError;
use crate::session::{Session, SessionInner, Side, Status};
use crate::substrate::PacketSubstrate;
use tracing::{debug, warn};

type Registry = Arc<Mutex<HashMap<String, Session>>>;

/// Listens on one substrate socket, demultiplexes inbound datagrams by
/// peer address, and hands newly-handshaken peers to `accept()`.
pub struct Server {
    substrate: Arc<dyn PacketSubstrate>,
    status: Arc<Mutex<Status>>,
    registry: Registry,
    next_session_id: Arc<AtomicU32>,
    params: Parameters,
    shutdown: Arc<AtomicBool>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    pub fn new(substrate: Arc<dyn PacketSubstrate>) -> Self {
        Self::with_parameters(substrate, Parameters::default())
    }

    pub fn with_parameters(substrate: Arc<dyn PacketSubstrate>, params: Parameters) -> Self {
        Self {
            substrate,
            status: Arc::new(Mutex::new(Status::Init)),
            registry: Arc::new(Mutex::new(HashMap::new())),
            next_session_id: Arc::new(AtomicU32::new(1)),
            params,
            shutdown: Arc::new(AtomicBool::new(false)),
            monitor: Mutex::new(None),
        }
    }

    /// Bind the substrate and start the monitor thread. Fails if this
    /// server is not `Init` (already listening, or already torn down).
    pub fn listen_at(&self, addr: &str) -> Result<(), UcpError> {
        {
            let mut status = self.status.lock().unwrap();
            if *status != Status::Init {
                return Err(UcpError::StateViolation { status: status.name() });
            }
            self.substrate.bind(addr)?;
            *status = Status::Listen;
        }

        self.shutdown.store(false, Ordering::Relaxed);
        let handle = thread::spawn({
            let substrate = self.substrate.clone();
            let status = self.status.clone();
            let registry = self.registry.clone();
            let next_session_id = self.next_session_id.clone();
            let params = self.params;
            let shutdown = self.shutdown.clone();
            move || monitor_loop(substrate, status, registry, next_session_id, params, shutdown)
        });
        *self.monitor.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Block until some registry entry reaches `Handshake`, atomically
    /// promote it to `Connected`, and return it. Returns `None` once this
    /// server leaves `Listen`. Tie-break among multiple pending handshakes
    /// is unspecified (spec.md §4.5).
    pub fn accept(&self) -> Option<Session> {
        loop {
            {
                let reg = self.registry.lock().unwrap();
                if let Some((_, session)) = reg.iter().find(|(_, s)| s.status() == Status::Handshake) {
                    session.lock().status = Status::Connected;
                    return Some(session.clone());
                }
            }
            if *self.status.lock().unwrap() != Status::Listen {
                return None;
            }
            thread::sleep(self.params.tick_interval);
        }
    }

    /// Number of sessions currently tracked (any status).
    pub fn connection_count(&self) -> usize {
        self.registry.lock().unwrap().len()
    }

    /// Stop the monitor thread and close the substrate. Idempotent.
    pub fn close(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.monitor.lock().unwrap().take() {
            let _ = handle.join();
        }
        *self.status.lock().unwrap() = Status::Exit;
        self.substrate.close();
    }
}

fn send_control(substrate: &Arc<dyn PacketSubstrate>, to: &str, msg_type: MessageType, session_id: u32) {
    let wire = Envelope::control(msg_type, session_id).encode();
    let _ = substrate.send_to(&wire, to);
}

fn dispatch(buf: &[u8], from: &str, substrate: &Arc<dyn PacketSubstrate>, registry: &Registry, next_session_id: &AtomicU32, params: &Parameters) {
    let env = match Envelope::decode(buf, from) {
        Ok(env) => env,
        Err(_) => return, // MalformedEnvelope: server ignores, per spec.md §7.
    };

    match env.msg_type {
        MessageType::NewSession => {
            let existing_id = registry.lock().unwrap().get(from).map(|s| s.session_id());
            let session_id = match existing_id {
                Some(id) => id,
                None => {
                    let session_id = next_session_id.fetch_add(1, Ordering::Relaxed);
                    let mut engine = Box::new(WindowEngine::new(params.engine));
                    let out_substrate = substrate.clone();
                    let out_remote = from.to_string();
                    engine.set_output(Box::new(move |bytes| {
                        let wire = Envelope::data(session_id, bytes).encode();
                        let _ = out_substrate.send_to(&wire, &out_remote);
                    }));
                    let local_address = substrate.address();
                    let inner = SessionInner::new(session_id, local_address, from.to_string(), Status::Handshake, engine);
                    let session = Session::new(Arc::new(Mutex::new(inner)), Side::Server);
                    registry.lock().unwrap().insert(from.to_string(), session);
                    debug!(peer = from, session_id, "registered new connection");
                    session_id
                }
            };
            send_control(substrate, from, MessageType::AcceptSession, session_id);
        }
        MessageType::CloseSession => {
            if let Some(session) = registry.lock().unwrap().get(from) {
                session.lock().status = Status::Exit;
            }
        }
        MessageType::Data => {
            if let Some(session) = registry.lock().unwrap().get(from) {
                let mut guard = session.lock();
                let _ = guard.engine.input(&env.payload);
                guard.last_heartbeat_time = Instant::now();
            }
        }
        MessageType::Heartbeat => {
            let known = registry.lock().unwrap().get(from).is_some();
            if known {
                if let Some(session) = registry.lock().unwrap().get(from) {
                    session.lock().last_heartbeat_time = Instant::now();
                }
                send_control(substrate, from, MessageType::Heartbeat, env.session_id);
            }
        }
        _ => {}
    }
}

fn maintenance(substrate: &Arc<dyn PacketSubstrate>, registry: &Registry, params: &Parameters) {
    let now = now_ms();
    let reg = registry.lock().unwrap();
    for (addr, session) in reg.iter() {
        let mut guard = session.lock();
        match guard.status {
            Status::Connected | Status::Handshake => {
                guard.engine.update(now);
                if guard.last_heartbeat_time.elapsed() > params.heartbeat_timeout {
                    warn!(peer = addr.as_str(), session_id = guard.session_id, "evicting connection after heartbeat timeout");
                    guard.status = Status::Exit;
                }
            }
            Status::Closed => {
                debug!(peer = addr.as_str(), session_id = guard.session_id, "flushing close");
                let wire = Envelope::control(MessageType::CloseSession, guard.session_id).encode();
                let _ = substrate.send_to(&wire, addr);
                guard.engine.update(now);
                guard.status = Status::Exit;
            }
            Status::Exit => {}
            Status::Init | Status::Listen => {}
        }
    }
    drop(reg);
    registry.lock().unwrap().retain(|_, session| session.status() != Status::Exit);
}

fn monitor_loop(substrate: Arc<dyn PacketSubstrate>, status: Arc<Mutex<Status>>, registry: Registry, next_session_id: Arc<AtomicU32>, params: Parameters, shutdown: Arc<AtomicBool>) {
    let mut recv_buf = vec![0u8; ENVELOPE_SIZE];

    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        if *status.lock().unwrap() != Status::Listen {
            break;
        }

        // Ingress: drain everything currently queued, bounded so one
        // chatty peer can't starve maintenance indefinitely.
        for _ in 0..256 {
            match substrate.recv_from(&mut recv_buf) {
                Ok(Some((n, from))) => dispatch(&recv_buf[..n], &from, &substrate, &registry, &next_session_id, &params),
                _ => break,
            }
        }

        maintenance(&substrate, &registry, &params);

        thread::sleep(params.tick_interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::memory::InMemorySubstrate;
    use std::time::Duration;

    fn fast_params() -> Parameters {
        let mut p = Parameters::default();
        p.tick_interval = Duration::from_millis(2);
        p.handshake_timeout = Duration::from_millis(60);
        p.heartbeat_timeout = Duration::from_millis(40);
        p.heartbeat_interval = Duration::from_millis(10);
        p
    }

    #[test]
    fn new_session_from_unknown_peer_is_registered_and_accepted() {
        let substrate = Arc::new(InMemorySubstrate::new());
        let server = Server::with_parameters(substrate, fast_params());
        server.listen_at("srv").unwrap();

        let client_substrate = InMemorySubstrate::new();
        client_substrate.bind("cli").unwrap();
        let wire = Envelope::control(MessageType::NewSession, 0).encode();
        client_substrate.send_to(&wire, "srv").unwrap();

        let session = server.accept().expect("should accept a pending handshake");
        assert_eq!(session.status(), Status::Connected);
        assert_eq!(session.address(), "cli");

        let mut buf = [0u8; ENVELOPE_SIZE];
        let mut accepted = None;
        for _ in 0..50 {
            if let Some((n, from)) = client_substrate.recv_from(&mut buf).unwrap() {
                accepted = Some(Envelope::decode(&buf[..n], &from).unwrap());
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }
        let accepted = accepted.expect("server should reply AcceptSession");
        assert_eq!(accepted.msg_type, MessageType::AcceptSession);
        assert_eq!(accepted.session_id, session.session_id());

        server.close();
    }

    #[test]
    fn duplicate_new_session_reuses_the_same_session_id() {
        let substrate = Arc::new(InMemorySubstrate::new());
        let server = Server::with_parameters(substrate, fast_params());
        server.listen_at("srv2").unwrap();

        let client_substrate = InMemorySubstrate::new();
        client_substrate.bind("cli2").unwrap();
        let wire = Envelope::control(MessageType::NewSession, 0).encode();
        client_substrate.send_to(&wire, "srv2").unwrap();
        client_substrate.send_to(&wire, "srv2").unwrap();

        thread::sleep(Duration::from_millis(20));
        assert_eq!(server.connection_count(), 1);

        let mut buf = [0u8; ENVELOPE_SIZE];
        let mut ids = Vec::new();
        for _ in 0..2 {
            for _ in 0..50 {
                if let Some((n, from)) = client_substrate.recv_from(&mut buf).unwrap() {
                    ids.push(Envelope::decode(&buf[..n], &from).unwrap().session_id);
                    break;
                }
                thread::sleep(Duration::from_millis(2));
            }
        }
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0], ids[1]);

        server.close();
    }
}
