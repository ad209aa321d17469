//! A real NNTP connection over TCP, optionally wrapped in TLS.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::{client::TlsStream, TlsConnector};
use tracing::instrument;

use crate::config::ProviderConfig;
use crate::error::TransportError;
use crate::transport::yenc::parse_header;
use crate::transport::{ArticleBody, ConnectionState, NntpTransport, YencHeader};

enum Socket {
    Plain(BufReader<TcpStream>),
    Tls(BufReader<TlsStream<TcpStream>>),
}

/// A real TCP (optionally TLS) connection to one NNTP provider.
pub struct TcpTransport {
    host: String,
    port: u16,
    use_tls: bool,
    username: String,
    password: String,
    socket: Option<Socket>,
    state: ConnectionState,
}

impl TcpTransport {
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            use_tls: config.use_tls,
            username: config.username.clone(),
            password: config.password.clone(),
            socket: None,
            state: ConnectionState::Unconnected,
        }
    }

    async fn write_line(&mut self, line: &str) -> Result<(), TransportError> {
        let socket = self.socket.as_mut().ok_or(TransportError::Closed)?;
        let bytes = format!("{line}\r\n");
        match socket {
            Socket::Plain(stream) => stream.get_mut().write_all(bytes.as_bytes()).await?,
            Socket::Tls(stream) => stream.get_mut().write_all(bytes.as_bytes()).await?,
        }
        Ok(())
    }

    async fn read_status_line(&mut self) -> Result<(u16, String), TransportError> {
        let socket = self.socket.as_mut().ok_or(TransportError::Closed)?;
        let mut line = String::new();
        let read = match socket {
            Socket::Plain(stream) => stream.read_line(&mut line).await?,
            Socket::Tls(stream) => stream.read_line(&mut line).await?,
        };
        if read == 0 {
            return Err(TransportError::Closed);
        }
        let code: u16 = line
            .get(0..3)
            .and_then(|code| code.parse().ok())
            .ok_or_else(|| TransportError::Protocol(format!("malformed status line: {line:?}")))?;
        Ok((code, line.trim_end().to_owned()))
    }

    /// Reads a dot-stuffed multi-line block terminated by `CRLF.CRLF`,
    /// undoing byte-stuffing of lines that start with a leading dot.
    async fn read_dotstuffed_block(&mut self) -> Result<String, TransportError> {
        let socket = self.socket.as_mut().ok_or(TransportError::Closed)?;
        let mut out = String::new();
        loop {
            let mut line = String::new();
            let read = match socket {
                Socket::Plain(stream) => stream.read_line(&mut line).await?,
                Socket::Tls(stream) => stream.read_line(&mut line).await?,
            };
            if read == 0 {
                return Err(TransportError::Closed);
            }
            if line == ".\r\n" || line == ".\n" {
                break;
            }
            if let Some(rest) = line.strip_prefix('.') {
                out.push_str(rest);
            } else {
                out.push_str(&line);
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl NntpTransport for TcpTransport {
    #[instrument(skip(self), fields(host = %self.host, port = self.port))]
    async fn connect_and_auth(&mut self) -> Result<(), TransportError> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|source| TransportError::CouldNotConnect {
                host: self.host.clone(),
                port: self.port,
                source,
            })?;
        stream.set_nodelay(true).ok();

        self.socket = Some(if self.use_tls {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let tls_config = ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            let connector = TlsConnector::from(Arc::new(tls_config));
            let server_name = ServerName::try_from(self.host.clone())
                .map_err(|_| TransportError::Protocol(format!("invalid TLS server name: {}", self.host)))?;
            let tls_stream = connector
                .connect(server_name, stream)
                .await
                .map_err(TransportError::Io)?;
            Socket::Tls(BufReader::new(tls_stream))
        } else {
            Socket::Plain(BufReader::new(stream))
        });

        let (code, _) = self.read_status_line().await?;
        if code != 200 && code != 201 {
            self.state = ConnectionState::Dirty;
            return Err(TransportError::Protocol(format!("unexpected greeting code {code}")));
        }

        self.write_line(&format!("AUTHINFO USER {}", self.username)).await?;
        let (code, _) = self.read_status_line().await?;
        if code == 381 {
            self.write_line(&format!("AUTHINFO PASS {}", self.password)).await?;
            let (code, _) = self.read_status_line().await?;
            if code != 281 {
                self.state = ConnectionState::Dirty;
                return Err(TransportError::CouldNotAuthenticate {
                    host: self.host.clone(),
                    port: self.port,
                });
            }
        } else if code != 281 {
            self.state = ConnectionState::Dirty;
            return Err(TransportError::CouldNotAuthenticate {
                host: self.host.clone(),
                port: self.port,
            });
        }

        self.state = ConnectionState::Idle;
        Ok(())
    }

    async fn stat(&mut self, message_id: &str) -> Result<bool, TransportError> {
        self.state = ConnectionState::InUse;
        self.write_line(&format!("STAT {message_id}")).await?;
        let (code, _) = self.read_status_line().await?;
        self.state = ConnectionState::Idle;
        match code {
            223 => Ok(true),
            430 => Ok(false),
            other => Err(TransportError::Protocol(format!("unexpected STAT code {other}"))),
        }
    }

    async fn head(&mut self, message_id: &str) -> Result<YencHeader, TransportError> {
        self.state = ConnectionState::InUse;
        self.write_line(&format!("HEAD {message_id}")).await?;
        let (code, _) = self.read_status_line().await?;
        if code == 430 {
            self.state = ConnectionState::Idle;
            return Err(TransportError::ArticleNotFound);
        }
        if code != 221 {
            self.state = ConnectionState::Dirty;
            return Err(TransportError::Protocol(format!("unexpected HEAD code {code}")));
        }
        let block = self.read_dotstuffed_block().await?;
        self.state = ConnectionState::Idle;
        parse_header(&block)
    }

    async fn body(&mut self, message_id: &str) -> Result<ArticleBody, TransportError> {
        self.state = ConnectionState::InUse;
        self.write_line(&format!("BODY {message_id}")).await?;
        let (code, _) = self.read_status_line().await?;
        if code == 430 {
            self.state = ConnectionState::Idle;
            return Err(TransportError::ArticleNotFound);
        }
        if code != 222 {
            self.state = ConnectionState::Dirty;
            return Err(TransportError::Protocol(format!("unexpected BODY code {code}")));
        }

        let block = match self.read_dotstuffed_block().await {
            Ok(block) => block,
            Err(err) => {
                self.state = ConnectionState::Dirty;
                return Err(err);
            }
        };

        let header_end = block.find("\r\n\r\n").unwrap_or(0);
        let header = parse_header(&block[..header_end.min(block.len())])?;

        let mut decoded = BytesMut::with_capacity(header.part_size as usize);
        for line in block.lines() {
            if line.starts_with("=y") {
                continue;
            }
            decode_yenc_line(line, &mut decoded);
        }

        self.state = ConnectionState::Idle;
        Ok(ArticleBody {
            header,
            bytes: Bytes::from(decoded.to_vec()),
        })
    }

    async fn date(&mut self) -> Result<(), TransportError> {
        self.write_line("DATE").await?;
        let (code, _) = self.read_status_line().await?;
        if code != 111 {
            return Err(TransportError::Protocol(format!("unexpected DATE code {code}")));
        }
        Ok(())
    }

    async fn group(&mut self, name: &str) -> Result<(), TransportError> {
        self.write_line(&format!("GROUP {name}")).await?;
        let (code, _) = self.read_status_line().await?;
        if code != 211 {
            return Err(TransportError::Protocol(format!("unexpected GROUP code {code}")));
        }
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    fn mark_dirty(&mut self) {
        self.state = ConnectionState::Dirty;
    }
}

/// Decodes one yEnc line (critical-char-escaped bytes offset by 42 modulo
/// 256) into `out`.
fn decode_yenc_line(line: &str, out: &mut BytesMut) {
    let mut escape_next = false;
    for byte in line.bytes() {
        if escape_next {
            out.extend_from_slice(&[byte.wrapping_sub(64).wrapping_sub(42)]);
            escape_next = false;
            continue;
        }
        if byte == b'=' {
            escape_next = true;
            continue;
        }
        out.extend_from_slice(&[byte.wrapping_sub(42)]);
    }
}
