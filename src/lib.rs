// src/lib.rs

pub mod client;
pub mod config;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod server;
pub mod session;
pub mod substrate;

pub use client::Client;
pub use config::{EngineParameters, Parameters};
pub use engine::{OutputFn, ReliabilityEngine, WindowEngine};
pub use envelope::{Envelope, MessageType};
pub use error::UcpError;
pub use server::Server;
pub use session::{Session, Status};
pub use substrate::memory::InMemorySubstrate;
pub use substrate::udp::UdpSubstrate;
pub use substrate::PacketSubstrate;
