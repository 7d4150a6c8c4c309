//! The concrete UDP [`PacketSubstrate`].
//!
//! spec.md §1 calls "the specific UDP adapter" out of scope for the core —
//! meaning production hardening (socket buffer tuning, dual-stack IPv6,
//! `SO_REUSEADDR` policy) is not this crate's concern. A substrate trait
//! with no implementation that actually reaches the network is useless
//! outside tests, so this module provides the minimal conforming one:
//! `std::net::UdpSocket` in non-blocking mode, matching the "ip:port"
//! string form spec.md §6 specifies.

use std::net::UdpSocket;
use std::sync::Mutex;

use super::PacketSubstrate;
use crate::error::UcpError;

pub struct UdpSubstrate {
    socket: Mutex<Option<UdpSocket>>,
}

impl UdpSubstrate {
    pub fn new() -> Self {
        Self {
            socket: Mutex::new(None),
        }
    }
}

impl Default for UdpSubstrate {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketSubstrate for UdpSubstrate {
    fn bind(&self, address: &str) -> Result<(), UcpError> {
        let bind_addr = if address.is_empty() { "0.0.0.0:0" } else { address };
        let socket = UdpSocket::bind(bind_addr).map_err(|e| UcpError::BindFailed {
            address: bind_addr.to_string(),
            reason: e.to_string(),
        })?;
        socket.set_nonblocking(true).map_err(|e| UcpError::BindFailed {
            address: bind_addr.to_string(),
            reason: e.to_string(),
        })?;
        *self.socket.lock().unwrap() = Some(socket);
        Ok(())
    }

    fn address(&self) -> String {
        self.socket
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|s| s.local_addr().ok())
            .map(|a| a.to_string())
            .unwrap_or_default()
    }

    fn send_to(&self, buf: &[u8], to: &str) -> Result<usize, UcpError> {
        let guard = self.socket.lock().unwrap();
        let socket = guard.as_ref().ok_or_else(|| UcpError::SubstrateFailure {
            address: to.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotConnected, "not bound"),
        })?;

        if let Ok(local) = socket.local_addr() {
            if local.to_string() == to {
                return Err(UcpError::SubstrateFailure {
                    address: to.to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "cannot send to self"),
                });
            }
        }

        socket
            .send_to(buf, to)
            .map_err(|e| UcpError::SubstrateFailure {
                address: to.to_string(),
                source: e,
            })
    }

    fn recv_from(&self, buf: &mut [u8]) -> Result<Option<(usize, String)>, UcpError> {
        let guard = self.socket.lock().unwrap();
        let Some(socket) = guard.as_ref() else {
            return Ok(None);
        };

        match socket.recv_from(buf) {
            Ok((n, from)) => Ok(Some((n, from.to_string()))),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(UcpError::SubstrateFailure {
                address: self.address(),
                source: e,
            }),
        }
    }

    fn close(&self) {
        *self.socket.lock().unwrap() = None;
    }
}
