//! # Transport Layer
//!
//! Hub addressing and the byte streams sessions run over.
//!
//! ## URL forms
//! ```text
//! adc://[nick[:password]@]host[:port][/path/file]
//! adcs://host[:port]?kp=SHA256/<base32>
//! ```
//! The port defaults to 411. Peer connections are always plain TCP.

pub mod tls;

use std::net::SocketAddr;
use std::time::Duration;

use percent_encoding::percent_decode_str;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, instrument};
use url::Url;

use crate::config::DEFAULT_HUB_PORT;
use crate::core::identifier::decode_base32_lenient;
use crate::error::{ProtocolError, Result};
use crate::utils::timeout::with_timeout_error;

/// Any duplex byte stream a session can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Adc,
    Adcs,
}

/// Where a hub lives and how to reach it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubEndpoint {
    scheme: Scheme,
    host: String,
    port: u16,
    keyprint: Option<Vec<u8>>,
    nick: Option<String>,
    password: Option<String>,
    path: String,
}

fn decoded(text: &str) -> String {
    percent_decode_str(text).decode_utf8_lossy().into_owned()
}

impl HubEndpoint {
    pub fn parse(text: &str) -> Result<Self> {
        let url = Url::parse(text)
            .map_err(|e| ProtocolError::ConfigError(format!("invalid hub URL {text:?}: {e}")))?;
        Self::from_url(&url)
    }

    pub fn from_url(url: &Url) -> Result<Self> {
        let scheme = match url.scheme() {
            "adc" => Scheme::Adc,
            "adcs" => Scheme::Adcs,
            other => {
                return Err(ProtocolError::ConfigError(format!(
                    "unsupported hub scheme {other:?}"
                )))
            }
        };
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ProtocolError::ConfigError(format!("hub URL has no host: {url}")))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();

        let keyprint = match url.query_pairs().find(|(k, _)| k == "kp") {
            Some((_, kp)) => Some(parse_keyprint(&kp)?),
            None => None,
        };

        Ok(Self {
            scheme,
            host,
            port: url.port().unwrap_or(DEFAULT_HUB_PORT),
            keyprint,
            nick: Some(url.username()).filter(|u| !u.is_empty()).map(decoded),
            password: url.password().map(decoded),
            path: decoded(url.path()),
        })
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn is_secure(&self) -> bool {
        self.scheme == Scheme::Adcs
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// SHA-256 fingerprint from `kp=SHA256/...`.
    pub fn keyprint(&self) -> Option<&[u8]> {
        self.keyprint.as_deref()
    }

    pub fn nick(&self) -> Option<&str> {
        self.nick.as_deref()
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// Decoded URL path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Last path segment, if the URL names a file.
    pub fn file_name(&self) -> Option<&str> {
        self.path.rsplit('/').next().filter(|name| !name.is_empty())
    }
}

fn parse_keyprint(kp: &str) -> Result<Vec<u8>> {
    let encoded = kp.strip_prefix("SHA256/").ok_or_else(|| {
        ProtocolError::ConfigError(format!("unsupported key print {kp:?}, expected SHA256/..."))
    })?;
    let hash = decode_base32_lenient(encoded)?;
    if hash.len() != 32 {
        return Err(ProtocolError::ConfigError(format!(
            "key print has {} bytes, expected 32",
            hash.len()
        )));
    }
    Ok(hash)
}

/// Open a connection to the hub, with TLS for `adcs`.
#[instrument(skip(endpoint), fields(hub = %endpoint.address(), secure = endpoint.is_secure()))]
pub async fn connect_hub(endpoint: &HubEndpoint, timeout: Duration) -> Result<BoxedStream> {
    let address = endpoint.address();
    let tcp = with_timeout_error(
        async {
            TcpStream::connect(address.as_str()).await.map_err(|e| {
                ProtocolError::ConnectionError(format!("cannot reach hub {address}: {e}"))
            })
        },
        timeout,
    )
    .await?;
    tcp.set_nodelay(true)?;

    if !endpoint.is_secure() {
        debug!("connected");
        return Ok(Box::new(tcp));
    }

    let mut config = tls::TlsClientConfig::new(endpoint.host());
    if let Some(kp) = endpoint.keyprint() {
        config = config.with_pinned_cert_hash(kp.to_vec());
    }
    let stream = with_timeout_error(tls::connect(tcp, &config), timeout).await?;
    Ok(Box::new(stream))
}

/// Open a plain TCP connection to a peer.
#[instrument]
pub async fn connect_peer(addr: SocketAddr, timeout: Duration) -> Result<BoxedStream> {
    let tcp = with_timeout_error(
        async {
            TcpStream::connect(addr).await.map_err(|e| {
                ProtocolError::ConnectionError(format!("cannot reach peer {addr}: {e}"))
            })
        },
        timeout,
    )
    .await?;
    tcp.set_nodelay(true)?;
    Ok(Box::new(tcp))
}
