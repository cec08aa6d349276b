use std::{
    net::SocketAddr,
    sync::{Arc, OnceLock},
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpStream, UdpSocket},
};
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info};

use super::{LinkIo, LinkReader, LinkTransport, LinkWriter, TransportConfig};
use crate::error::LinkError;

/// Real serial, TCP and UDP links.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTransport;

#[async_trait]
impl LinkTransport for SystemTransport {
    async fn open(&self, cfg: &TransportConfig) -> Result<LinkIo, LinkError> {
        let failed = |e: std::io::Error| LinkError::OpenFailed {
            target: cfg.to_string(),
            reason: e.to_string(),
        };

        match cfg {
            TransportConfig::Serial { dev, baud } => {
                let port = tokio_serial::new(dev, *baud)
                    .open_native_async()
                    .map_err(|e| LinkError::OpenFailed {
                        target: cfg.to_string(),
                        reason: e.to_string(),
                    })?;
                let (rd, wr) = tokio::io::split(port);
                debug!("fc: opened {}", cfg);
                Ok(stream_io(rd, wr))
            }
            TransportConfig::Tcp { address } => {
                let stream = TcpStream::connect(address.as_str()).await.map_err(failed)?;
                stream.set_nodelay(true).map_err(failed)?;
                let (rd, wr) = stream.into_split();
                debug!("fc: connected {}", cfg);
                Ok(stream_io(rd, wr))
            }
            TransportConfig::Udp { bind } => {
                let sock = Arc::new(UdpSocket::bind(bind.as_str()).await.map_err(failed)?);
                let peer = Arc::new(OnceLock::new());
                debug!("fc: bound {}, waiting for first datagram", cfg);
                Ok(LinkIo {
                    reader: Box::new(UdpReader { sock: sock.clone(), peer: peer.clone() }),
                    writer: Box::new(UdpWriter { sock, peer }),
                })
            }
        }
    }
}

fn stream_io<R, W>(rd: R, wr: W) -> LinkIo
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    LinkIo {
        reader: Box::new(StreamReader(rd)),
        writer: Box::new(StreamWriter(wr)),
    }
}

struct StreamReader<R>(R);

#[async_trait]
impl<R: AsyncRead + Unpin + Send> LinkReader for StreamReader<R> {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, LinkError> {
        self.0.read(buf).await.map_err(|e| LinkError::Read(e.to_string()))
    }
}

struct StreamWriter<W>(W);

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> LinkWriter for StreamWriter<W> {
    async fn write(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        self.0.write_all(bytes).await.map_err(|e| LinkError::Write(e.to_string()))?;
        self.0.flush().await.map_err(|e| LinkError::Write(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), LinkError> {
        self.0.shutdown().await.map_err(|e| LinkError::Write(e.to_string()))
    }
}

struct UdpReader {
    sock: Arc<UdpSocket>,
    peer: Arc<OnceLock<SocketAddr>>,
}

#[async_trait]
impl LinkReader for UdpReader {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, LinkError> {
        loop {
            let (n, addr) = self
                .sock
                .recv_from(buf)
                .await
                .map_err(|e| LinkError::Read(e.to_string()))?;
            match self.peer.get() {
                Some(peer) if *peer != addr => continue,
                Some(_) => {}
                None => {
                    info!("fc: received packet from {}, locking to this address", addr);
                    let _ = self.peer.set(addr);
                }
            }
            // A zero-length datagram is not EOF on UDP.
            if n > 0 {
                return Ok(n);
            }
        }
    }
}

struct UdpWriter {
    sock: Arc<UdpSocket>,
    peer: Arc<OnceLock<SocketAddr>>,
}

#[async_trait]
impl LinkWriter for UdpWriter {
    async fn write(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        let peer = self.peer.get().ok_or(LinkError::NotConnected)?;
        self.sock
            .send_to(bytes, *peer)
            .await
            .map_err(|e| LinkError::Write(e.to_string()))?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), LinkError> {
        Ok(())
    }
}
