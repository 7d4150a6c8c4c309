//! An in-memory [`PacketSubstrate`] backed by a process-global address ->
//! mailbox map, for tests and single-process demos.
//!
//! Grounded on the "conditioner" pattern in `aeronet`'s `condition` module
//! (a wrapper that randomly/deterministically drops messages in transit) —
//! simplified here to loss only, since spec.md has no delay requirement and
//! the lettered scenarios in spec.md §8 need *deterministic* drops, not
//! just statistical ones.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use once_cell::sync::Lazy;
use rand::Rng;

use super::PacketSubstrate;
use crate::error::UcpError;

type Mailbox = VecDeque<(String, Vec<u8>)>;

struct Registry {
    mailboxes: HashMap<String, Mailbox>,
    bound: HashSet<String>,
}

static REGISTRY: Lazy<Mutex<Registry>> = Lazy::new(|| {
    Mutex::new(Registry {
        mailboxes: HashMap::new(),
        bound: HashSet::new(),
    })
});

static EPHEMERAL_COUNTER: AtomicU64 = AtomicU64::new(1);

type DropHook = dyn Fn(&str, &str, &[u8]) -> bool + Send + Sync;

/// An in-memory packet substrate. Endpoints are identified by an opaque
/// string key into the process-wide mailbox map; `send_to`/`recv_from`
/// never touch the OS network stack.
pub struct InMemorySubstrate {
    address: Mutex<Option<String>>,
    drop_hook: Mutex<Option<Box<DropHook>>>,
    loss_rate: Mutex<f32>,
}

impl InMemorySubstrate {
    pub fn new() -> Self {
        Self {
            address: Mutex::new(None),
            drop_hook: Mutex::new(None),
            loss_rate: Mutex::new(0.0),
        }
    }

    /// Install a deterministic filter: returning `true` drops the datagram
    /// in transit. Used by tests that need exact control (e.g. "drop the
    /// first NewSession, deliver the second").
    pub fn set_drop_hook<F>(&self, hook: F)
    where
        F: Fn(&str, &str, &[u8]) -> bool + Send + Sync + 'static,
    {
        *self.drop_hook.lock().unwrap() = Some(Box::new(hook));
    }

    /// Independent random loss, applied after the deterministic hook.
    /// `rate` is clamped to `0.0..=1.0`.
    pub fn set_loss_rate(&self, rate: f32) {
        *self.loss_rate.lock().unwrap() = rate.clamp(0.0, 1.0);
    }

    fn should_drop(&self, from: &str, to: &str, buf: &[u8]) -> bool {
        if let Some(hook) = self.drop_hook.lock().unwrap().as_ref() {
            if hook(from, to, buf) {
                return true;
            }
        }
        let rate = *self.loss_rate.lock().unwrap();
        rate > 0.0 && rand::thread_rng().gen::<f32>() < rate
    }
}

impl Default for InMemorySubstrate {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketSubstrate for InMemorySubstrate {
    fn bind(&self, address: &str) -> Result<(), UcpError> {
        let mut guard = self.address.lock().unwrap();
        if guard.is_some() {
            return Err(UcpError::BindFailed {
                address: address.to_string(),
                reason: "already bound".to_string(),
            });
        }

        let mut registry = REGISTRY.lock().unwrap();
        let chosen = if address.is_empty() {
            loop {
                let candidate = format!("mem:{}", EPHEMERAL_COUNTER.fetch_add(1, Ordering::Relaxed));
                if !registry.bound.contains(&candidate) {
                    break candidate;
                }
            }
        } else {
            if registry.bound.contains(address) {
                return Err(UcpError::BindFailed {
                    address: address.to_string(),
                    reason: "address already in use".to_string(),
                });
            }
            address.to_string()
        };

        registry.bound.insert(chosen.clone());
        registry.mailboxes.entry(chosen.clone()).or_default();
        *guard = Some(chosen);
        Ok(())
    }

    fn address(&self) -> String {
        self.address.lock().unwrap().clone().unwrap_or_default()
    }

    fn send_to(&self, buf: &[u8], to: &str) -> Result<usize, UcpError> {
        let from = self.address();
        if from.is_empty() {
            return Err(UcpError::SubstrateFailure {
                address: to.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotConnected, "not bound"),
            });
        }
        if from == to {
            return Err(UcpError::SubstrateFailure {
                address: to.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "cannot send to self"),
            });
        }

        if self.should_drop(&from, to, buf) {
            return Ok(buf.len());
        }

        let mut registry = REGISTRY.lock().unwrap();
        match registry.mailboxes.get_mut(to) {
            Some(mailbox) => {
                mailbox.push_back((from, buf.to_vec()));
                Ok(buf.len())
            }
            None => Ok(buf.len()), // unbound/unknown peer: datagram vanishes, like a real network.
        }
    }

    fn recv_from(&self, buf: &mut [u8]) -> Result<Option<(usize, String)>, UcpError> {
        let own = self.address();
        if own.is_empty() {
            return Ok(None);
        }
        let mut registry = REGISTRY.lock().unwrap();
        let Some(mailbox) = registry.mailboxes.get_mut(&own) else {
            return Ok(None);
        };
        match mailbox.pop_front() {
            Some((from, datagram)) => {
                let n = datagram.len().min(buf.len());
                buf[..n].copy_from_slice(&datagram[..n]);
                Ok(Some((n, from)))
            }
            None => Ok(None),
        }
    }

    fn close(&self) {
        let mut guard = self.address.lock().unwrap();
        if let Some(address) = guard.take() {
            let mut registry = REGISTRY.lock().unwrap();
            registry.bound.remove(&address);
            registry.mailboxes.remove(&address);
        }
    }
}

impl Drop for InMemorySubstrate {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echoes_a_datagram_between_two_endpoints() {
        let a = InMemorySubstrate::new();
        let b = InMemorySubstrate::new();
        a.bind("a").unwrap();
        b.bind("b").unwrap();

        a.send_to(b"hello", "b").unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = b.recv_from(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(from, "a");
    }

    #[test]
    fn recv_from_returns_none_when_empty() {
        let a = InMemorySubstrate::new();
        a.bind("").unwrap();
        let mut buf = [0u8; 16];
        assert!(a.recv_from(&mut buf).unwrap().is_none());
    }

    #[test]
    fn duplicate_bind_fails() {
        let a = InMemorySubstrate::new();
        let b = InMemorySubstrate::new();
        a.bind("dup").unwrap();
        assert!(b.bind("dup").is_err());
    }

    #[test]
    fn drop_hook_discards_matching_datagrams() {
        let a = InMemorySubstrate::new();
        let b = InMemorySubstrate::new();
        a.bind("a2").unwrap();
        b.bind("b2").unwrap();
        a.set_drop_hook(|_from, _to, _buf| true);

        a.send_to(b"x", "b2").unwrap();
        let mut buf = [0u8; 16];
        assert!(b.recv_from(&mut buf).unwrap().is_none());
    }
}
