//! Byte transport for HTTP and WebSocket traffic
//!
//! monoio reads and writes with owned buffers, rustls works on borrowed
//! ones. `MaybeTlsStream` hides both behind a borrowed-slice interface:
//! `ws://`/`http://` go straight over TCP, `wss://`/`https://` through a
//! rustls client session.

use crate::errors::{Result, StreamError};

use monoio::io::{AsyncReadRent, AsyncWriteRentExt};
use monoio::net::TcpStream;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, RootCertStore};
use std::io::{Read, Write};
use std::sync::{Arc, OnceLock};
use tracing::debug;
use url::Url;

const READ_CHUNK: usize = 16 * 1024;

/// Shared TLS client configuration with the webpki root store
pub fn default_tls_config() -> Arc<ClientConfig> {
    static CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();
    CONFIG
        .get_or_init(|| {
            let mut root_store = RootCertStore::empty();
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            Arc::new(
                ClientConfig::builder()
                    .with_root_certificates(root_store)
                    .with_no_client_auth(),
            )
        })
        .clone()
}

/// TCP stream, optionally wrapped in TLS
pub enum MaybeTlsStream {
    Plain { stream: TcpStream, scratch: Vec<u8> },
    Tls(Box<TlsStream>),
}

impl MaybeTlsStream {
    /// Open a connection to the host named by `url`
    pub async fn connect(url: &Url, tls_config: &Arc<ClientConfig>) -> Result<Self> {
        let secure = match url.scheme() {
            "wss" | "https" => true,
            "ws" | "http" => false,
            other => {
                return Err(StreamError::InvalidUrl(format!("Unsupported scheme: {other}")));
            }
        };

        let host = url
            .host_str()
            .ok_or_else(|| StreamError::InvalidUrl("No host in URL".to_string()))?;
        let port = url
            .port_or_known_default()
            .unwrap_or(if secure { 443 } else { 80 });

        let stream = TcpStream::connect(format!("{host}:{port}"))
            .await
            .map_err(|e| StreamError::NetworkError(format!("TCP connect to {host}:{port} failed: {e}")))?;
        debug!("TCP connection established to {}:{}", host, port);

        if !secure {
            return Ok(MaybeTlsStream::Plain {
                stream,
                scratch: Vec::new(),
            });
        }

        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| StreamError::NetworkError(format!("Invalid server name: {e}")))?;
        let session = ClientConnection::new(tls_config.clone(), server_name)
            .map_err(|e| StreamError::NetworkError(format!("TLS setup failed: {e}")))?;

        let mut tls = TlsStream::new(stream, session);
        tls.complete_handshake().await?;
        debug!("TLS handshake completed with {}", host);

        Ok(MaybeTlsStream::Tls(Box::new(tls)))
    }

    /// Write every byte of `data`
    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        match self {
            MaybeTlsStream::Plain { stream, .. } => {
                let (result, _) = stream.write_all(data.to_vec()).await;
                result.map_err(|e| StreamError::NetworkError(format!("TCP write failed: {e}")))?;
                Ok(())
            }
            MaybeTlsStream::Tls(tls) => tls.write_all(data).await,
        }
    }

    /// Read into `buf`. Returns 0 once the peer has closed the stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self {
            MaybeTlsStream::Plain { stream, scratch } => {
                // The buffer is moved into the read op; a cancelled read leaves an empty one behind.
                let mut owned = std::mem::take(scratch);
                owned.resize(buf.len().min(READ_CHUNK), 0);

                let (result, owned) = stream.read(owned).await;
                let n = result.map_err(|e| StreamError::NetworkError(format!("TCP read failed: {e}")))?;
                buf[..n].copy_from_slice(&owned[..n]);
                *scratch = owned;
                Ok(n)
            }
            MaybeTlsStream::Tls(tls) => tls.read(buf).await,
        }
    }
}

/// rustls session driven over a monoio TCP stream
pub struct TlsStream {
    stream: TcpStream,
    session: ClientConnection,
    outgoing: Vec<u8>,
}

impl TlsStream {
    fn new(stream: TcpStream, session: ClientConnection) -> Self {
        Self {
            stream,
            session,
            outgoing: Vec::with_capacity(READ_CHUNK),
        }
    }

    async fn complete_handshake(&mut self) -> Result<()> {
        while self.session.is_handshaking() {
            self.flush_tls().await?;
            if !self.session.is_handshaking() {
                break;
            }
            if self.session.wants_read() {
                if self.fill_tls().await? == 0 {
                    return Err(StreamError::NetworkError(
                        "Connection closed during TLS handshake".to_string(),
                    ));
                }
            } else if !self.session.wants_write() {
                return Err(StreamError::NetworkError("TLS handshake stalled".to_string()));
            }
        }
        self.flush_tls().await
    }

    /// Send any TLS records rustls has queued
    async fn flush_tls(&mut self) -> Result<()> {
        while self.session.wants_write() {
            self.outgoing.clear();
            let written = self
                .session
                .write_tls(&mut self.outgoing)
                .map_err(|e| StreamError::NetworkError(format!("TLS write failed: {e}")))?;
            if written == 0 {
                break;
            }
            let (result, returned) = self.stream.write_all(std::mem::take(&mut self.outgoing)).await;
            self.outgoing = returned;
            result.map_err(|e| StreamError::NetworkError(format!("TCP write failed: {e}")))?;
        }
        Ok(())
    }

    /// Feed one TCP read into the TLS session. Returns the TCP byte count.
    async fn fill_tls(&mut self) -> Result<usize> {
        let (result, buf) = self.stream.read(vec![0u8; READ_CHUNK]).await;
        let n = result.map_err(|e| StreamError::NetworkError(format!("TCP read failed: {e}")))?;
        if n == 0 {
            return Ok(0);
        }

        self.session
            .read_tls(&mut std::io::Cursor::new(&buf[..n]))
            .map_err(|e| StreamError::NetworkError(format!("TLS read failed: {e}")))?;
        self.session
            .process_new_packets()
            .map_err(|e| StreamError::NetworkError(format!("TLS processing failed: {e}")))?;
        Ok(n)
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.session
            .writer()
            .write_all(data)
            .map_err(|e| StreamError::NetworkError(format!("TLS application write failed: {e}")))?;
        self.flush_tls().await
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        loop {
            match self.session.reader().read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    return Err(StreamError::NetworkError(format!("TLS read failed: {e}")));
                }
            }

            if self.fill_tls().await? == 0 {
                return Ok(0);
            }
            // Session tickets and key updates may need an answer.
            self.flush_tls().await?;
        }
    }
}
