//! Byte transports to the flight controller.
//!
//! A transport only moves bytes. Framing and message semantics live in
//! [`crate::codec`]; reconnect policy lives in [`crate::connection`].

#[cfg(any(test, feature = "mock"))]
pub mod mock;
mod system;

use std::fmt;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::LinkError;

pub use system::SystemTransport;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    Serial { dev: String, baud: u32 },
    Tcp { address: String },
    /// Binds locally and locks onto the first peer that sends a datagram.
    Udp { bind: String },
}

impl fmt::Display for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportConfig::Serial { dev, baud } => write!(f, "serial:{dev}:{baud}"),
            TransportConfig::Tcp { address } => write!(f, "tcp:{address}"),
            TransportConfig::Udp { bind } => write!(f, "udp:{bind}"),
        }
    }
}

#[async_trait]
pub trait LinkReader: Send {
    /// Reads available bytes into `buf`. `Ok(0)` means the peer closed.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, LinkError>;
}

#[async_trait]
pub trait LinkWriter: Send {
    async fn write(&mut self, bytes: &[u8]) -> Result<(), LinkError>;
    async fn close(&mut self) -> Result<(), LinkError>;
}

/// Both halves of an open link. The read half goes to the read loop, the
/// write half is shared by everything that sends.
pub struct LinkIo {
    pub reader: Box<dyn LinkReader>,
    pub writer: Box<dyn LinkWriter>,
}

#[async_trait]
pub trait LinkTransport: Send + Sync {
    async fn open(&self, cfg: &TransportConfig) -> Result<LinkIo, LinkError>;
}
