//! Client state machine (spec.md §4.4, component E).
//!
//! One monitor thread per `Client`, ticking at `Parameters::tick_interval`,
//! exactly as spec.md §5 mandates — no async runtime. `connect` blocks the
//! calling thread (via cooperative tick-interval sleeps) until the monitor
//! thread reaches `Connected` or the handshake deadline passes; the two
//! threads coordinate purely through `ClientState` behind a `Mutex`.

use std::sync::atomic::{AtomicBool, Ordering};
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

struct ClientState {
    status: Status,
    remote_address: String,
    handshake_deadline: Instant,
    session: Option<Session>,
    last_error: Option<UcpError>,
}

/// Drives one session to a single remote peer. Safe to share across
/// threads; `connect`/`close` may be called from any thread (the spec
/// permits application threads to call the public surface concurrently
/// with the monitor).
pub struct Client {
    substrate: Arc<dyn PacketSubstrate>,
    state: Arc<Mutex<ClientState>>,
    params: Parameters,
    shutdown: Arc<AtomicBool>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    pub fn new(substrate: Arc<dyn PacketSubstrate>) -> Self {
        Self::with_parameters(substrate, Parameters::default())
    }

    pub fn with_parameters(substrate: Arc<dyn PacketSubstrate>, params: Parameters) -> Self {
        Self {
            substrate,
            state: Arc::new(Mutex::new(ClientState {
                status: Status::Init,
                remote_address: String::new(),
                handshake_deadline: Instant::now(),
                session: None,
                last_error: None,
            })),
            params,
            shutdown: Arc::new(AtomicBool::new(false)),
            monitor: Mutex::new(None),
        }
    }

    /// Bind (if not already bound), send `NewSession` once per tick to
    /// `remote` for up to `handshake_timeout`, and block until `Connected`
    /// or the deadline passes.
    pub fn connect(&self, remote: &str) -> Result<Session, UcpError> {
        {
            let mut state = self.state.lock().unwrap();
            if state.status != Status::Init {
                return Err(UcpError::StateViolation {
                    status: state.status.name(),
                });
            }
            if self.substrate.address().is_empty() {
                self.substrate.bind("")?;
            }
            state.remote_address = remote.to_string();
            state.status = Status::Handshake;
            state.handshake_deadline = Instant::now() + self.params.handshake_timeout;
            state.last_error = None;
        }

        self.shutdown.store(false, Ordering::Relaxed);
        let handle = thread::spawn({
            let substrate = self.substrate.clone();
            let state = self.state.clone();
            let params = self.params;
            let shutdown = self.shutdown.clone();
            move || monitor_loop(substrate, state, params, shutdown)
        });
        *self.monitor.lock().unwrap() = Some(handle);

        let poll_deadline = Instant::now() + self.params.handshake_timeout + self.params.tick_interval;
        loop {
            let session = { self.state.lock().unwrap().session.clone() };
            if let Some(session) = session {
                if session.status() == Status::Connected {
                    return Ok(session);
                }
            }
            let status = { self.state.lock().unwrap().status };
            if status == Status::Exit || status == Status::Init {
                let err = self
                    .state
                    .lock()
                    .unwrap()
                    .last_error
                    .take()
                    .unwrap_or(UcpError::HandshakeTimeout {
                        remote: remote.to_string(),
                        elapsed_ms: self.params.handshake_timeout.as_millis() as u64,
                    });
                return Err(err);
            }
            if Instant::now() >= poll_deadline {
                return Err(UcpError::HandshakeTimeout {
                    remote: remote.to_string(),
                    elapsed_ms: self.params.handshake_timeout.as_millis() as u64,
                });
            }
            thread::sleep(self.params.tick_interval);
        }
    }

    /// From `Connected`: flush a `CloseSession` to the peer, tick the
    /// engine once more, and transition to `Closed`/`Exit`. Idempotent.
    pub fn close(&self) {
        let session = { self.state.lock().unwrap().session.clone() };
        match session {
            Some(session) => {
                let mut guard = session.lock();
                if guard.status == Status::Connected {
                    let wire = Envelope::control(MessageType::CloseSession, guard.session_id).encode();
                    let _ = self.substrate.send_to(&wire, &guard.remote_address);
                    guard.engine.update(now_ms());
                    guard.status = Status::Closed;
                }
            }
            None => {
                let mut state = self.state.lock().unwrap();
                state.status = Status::Exit;
            }
        }

        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.monitor.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.substrate.close();
    }
}

fn send_control(substrate: &Arc<dyn PacketSubstrate>, remote: &str, msg_type: MessageType, session_id: u32) {
    let wire = Envelope::control(msg_type, session_id).encode();
    let _ = substrate.send_to(&wire, remote);
}

fn recv_one(substrate: &Arc<dyn PacketSubstrate>, buf: &mut [u8]) -> Option<(usize, String)> {
    substrate.recv_from(buf).ok().flatten()
}

fn monitor_loop(substrate: Arc<dyn PacketSubstrate>, state: Arc<Mutex<ClientState>>, params: Parameters, shutdown: Arc<AtomicBool>) {
    let mut recv_buf = vec![0u8; ENVELOPE_SIZE];
    let mut last_heartbeat_sent = Instant::now();

    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        let session = { state.lock().unwrap().session.clone() };

        if let Some(session) = session {
            match session.status() {
                Status::Connected => {
                    session.lock().engine.update(now_ms());

                    if let Some((n, from)) = recv_one(&substrate, &mut recv_buf) {
                        let remote = session.lock().remote_address.clone();
                        if from != remote {
                            session.lock().status = Status::Exit;
                        } else {
                            match Envelope::decode(&recv_buf[..n], &from) {
                                Ok(env) if env.msg_type == MessageType::CloseSession => {
                                    session.lock().status = Status::Closed;
                                }
                                Ok(env) if env.msg_type == MessageType::Data => {
                                    let _ = session.lock().engine.input(&env.payload);
                                }
                                Ok(env) if env.msg_type == MessageType::Heartbeat => {}
                                _ => session.lock().status = Status::Exit,
                            }
                        }
                    }

                    if last_heartbeat_sent.elapsed() >= params.heartbeat_interval {
                        let (remote, session_id) = {
                            let guard = session.lock();
                            (guard.remote_address.clone(), guard.session_id)
                        };
                        send_control(&substrate, &remote, MessageType::Heartbeat, session_id);
                        last_heartbeat_sent = Instant::now();
                    }
                }
                Status::Closed => {
                    let mut guard = session.lock();
                    let wire = Envelope::control(MessageType::CloseSession, guard.session_id).encode();
                    let _ = substrate.send_to(&wire, &guard.remote_address);
                    guard.engine.update(now_ms());
                    guard.status = Status::Exit;
                }
                Status::Exit => break,
                _ => {}
            }
        } else {
            let (status, remote, deadline) = {
                let s = state.lock().unwrap();
                (s.status, s.remote_address.clone(), s.handshake_deadline)
            };

            match status {
                Status::Handshake => {
                    if Instant::now() >= deadline {
                        warn!(%remote, "handshake timed out");
                        let mut s = state.lock().unwrap();
                        s.status = Status::Exit;
                        s.last_error = Some(UcpError::HandshakeTimeout {
                            remote: remote.clone(),
                            elapsed_ms: params.handshake_timeout.as_millis() as u64,
                        });
                        break;
                    }

                    send_control(&substrate, &remote, MessageType::NewSession, 0);

                    if let Some((n, from)) = recv_one(&substrate, &mut recv_buf) {
                        if from != remote {
                            let mut s = state.lock().unwrap();
                            s.status = Status::Exit;
                            s.last_error = Some(UcpError::MalformedEnvelope {
                                from,
                                reason: "handshake reply from unexpected source".to_string(),
                            });
                            break;
                        }

                        match Envelope::decode(&recv_buf[..n], &from) {
                            Ok(env) if env.msg_type == MessageType::AcceptSession => {
                                let mut engine = Box::new(WindowEngine::new(params.engine));
                                let out_substrate = substrate.clone();
                                let out_remote = remote.clone();
                                let out_session_id = env.session_id;
                                engine.set_output(Box::new(move |bytes| {
                                    let wire = Envelope::data(out_session_id, bytes).encode();
                                    let _ = out_substrate.send_to(&wire, &out_remote);
                                }));

                                let local_address = substrate.address();
                                let inner = SessionInner::new(
                                    env.session_id,
                                    local_address,
                                    remote.clone(),
                                    Status::Connected,
                                    engine,
                                );
                                let new_session = Session::new(Arc::new(Mutex::new(inner)), Side::Client);
                                debug!(%remote, session_id = env.session_id, "handshake accepted");
                                state.lock().unwrap().session = Some(new_session);
                            }
                            Ok(env) if env.msg_type == MessageType::RejectSession => {
                                warn!(%remote, "handshake rejected by peer");
                                let mut s = state.lock().unwrap();
                                s.status = Status::Init;
                                s.last_error = Some(UcpError::HandshakeReject { remote: remote.clone() });
                                break;
                            }
                            other => {
                                let mut s = state.lock().unwrap();
                                s.status = Status::Exit;
                                s.last_error = Some(UcpError::MalformedEnvelope {
                                    from,
                                    reason: format!("unexpected message during handshake: {other:?}"),
                                });
                                break;
                            }
                        }
                    }
                }
                Status::Exit | Status::Init => break,
                _ => {}
            }
        }

        thread::sleep(params.tick_interval);
    }
}
