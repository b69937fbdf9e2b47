//! WebTransport-over-QUIC binding for the nagare transport traits, built on
//! `quinn` and `webtransport-quinn`.

use std::{
    fs, io, net,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use thiserror::Error;

use nagare::{transport, NagareError, NagareResult};

#[derive(Error, Debug)]
pub enum EndpointError {
    #[error("no certificate found in the PEM chain")]
    MissingCertificate,

    #[error("expected a single PKCS#8 private key")]
    SingleKeyRequired,

    #[error(transparent)]
    Tls(#[from] rustls::Error),

    #[error(transparent)]
    IOError(#[from] io::Error),

    #[error(transparent)]
    Connection(#[from] quinn::ConnectionError),

    #[error("WebTransport handshake failed: {0}")]
    Handshake(String),
}

pub struct EndpointConfig {
    pub addr: net::SocketAddr,
    pub cert: PathBuf,
    pub key: PathBuf,
}

pub struct Endpoint {
    quic: quinn::Endpoint,
}

impl Endpoint {
    /// Bind the QUIC server endpoint for the given certificate.
    pub fn new(config: EndpointConfig) -> Result<Self, EndpointError> {
        let tls = load_tls(&config.cert, &config.key)?;
        let quic = quinn::Endpoint::server(quic_server_config(tls), config.addr)?;
        Ok(Self { quic })
    }

    pub fn local_addr(&self) -> io::Result<net::SocketAddr> {
        self.quic.local_addr()
    }

    /// Next incoming QUIC connection, or `None` once the endpoint closes.
    pub async fn accept(&self) -> Option<quinn::Connecting> {
        self.quic.accept().await
    }

    pub fn close(&self) {
        self.quic.close(0u32.into(), b"shutdown");
    }

    pub async fn wait_idle(&self) {
        self.quic.wait_idle().await;
    }
}

/// TLS 1.3 only (QUIC requires it), offering the WebTransport ALPN and
/// allowing 0-RTT session data.
fn load_tls(cert: &Path, key: &Path) -> Result<rustls::ServerConfig, EndpointError> {
    let chain = rustls_pemfile::certs(&mut pem_reader(cert)?)?;
    if chain.is_empty() {
        return Err(EndpointError::MissingCertificate);
    }
    let chain = chain.into_iter().map(rustls::Certificate).collect();

    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut pem_reader(key)?)?;
    let key = match keys.len() {
        1 => rustls::PrivateKey(keys.remove(0)),
        _ => return Err(EndpointError::SingleKeyRequired),
    };

    let mut tls = rustls::ServerConfig::builder()
        .with_safe_default_cipher_suites()
        .with_safe_default_kx_groups()
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_no_client_auth()
        .with_single_cert(chain, key)?;

    tls.max_early_data_size = u32::MAX;
    tls.alpn_protocols = vec![webtransport_quinn::ALPN.to_vec()];

    Ok(tls)
}

fn pem_reader(path: &Path) -> io::Result<io::BufReader<fs::File>> {
    Ok(io::BufReader::new(fs::File::open(path)?))
}

fn quic_server_config(tls: rustls::ServerConfig) -> quinn::ServerConfig {
    // BBR congestion control, and a keep-alive so an idle viewer does not
    // time out between segments.
    let mut transport = quinn::TransportConfig::default();
    transport.keep_alive_interval(Some(Duration::from_secs(2)));
    transport.congestion_controller_factory(Arc::new(quinn::congestion::BbrConfig::default()));

    let mut server = quinn::ServerConfig::with_crypto(Arc::new(tls));
    server.transport = Arc::new(transport);
    server
}

/// Finish the QUIC handshake and answer the WebTransport CONNECT request.
pub async fn accept_session(conn: quinn::Connecting) -> Result<WebTransportSession, EndpointError> {
    let conn = conn.await?;

    tracing::debug!(
        id = conn.stable_id(),
        ip = %conn.remote_address(),
        "established QUIC connection"
    );

    let request = webtransport_quinn::accept(conn)
        .await
        .map_err(|err| EndpointError::Handshake(err.to_string()))?;

    let session = request
        .ok()
        .await
        .map_err(|err| EndpointError::Handshake(err.to_string()))?;

    Ok(WebTransportSession::new(session))
}

#[derive(Clone)]
pub struct WebTransportSession {
    inner: webtransport_quinn::Session,

    // Stock quinn exposes no bandwidth cap, so the debug knob lands in a
    // cell the session reports back through `etp`.
    max_bandwidth: Arc<AtomicU64>,
}

impl WebTransportSession {
    pub fn new(inner: webtransport_quinn::Session) -> Self {
        Self {
            inner,
            max_bandwidth: Arc::new(AtomicU64::new(0)),
        }
    }
}

fn transport_err<E: std::fmt::Display>(err: E) -> NagareError {
    NagareError::Transport(err.to_string())
}

impl transport::Transport for WebTransportSession {
    type SendStream = webtransport_quinn::SendStream;
    type RecvStream = webtransport_quinn::RecvStream;

    async fn accept_uni(&mut self) -> NagareResult<Self::RecvStream> {
        self.inner.accept_uni().await.map_err(transport_err)
    }

    async fn accept_bi(&mut self) -> NagareResult<(Self::SendStream, Self::RecvStream)> {
        self.inner.accept_bi().await.map_err(transport_err)
    }

    async fn open_uni(&mut self) -> NagareResult<Self::SendStream> {
        self.inner.open_uni().await.map_err(transport_err)
    }

    fn max_bandwidth(&self) -> u64 {
        self.max_bandwidth.load(Ordering::Acquire)
    }

    fn set_max_bandwidth(&self, bytes_per_sec: u64) {
        self.max_bandwidth.store(bytes_per_sec, Ordering::Release);
    }

    fn close(&self, code: u32, reason: &str) {
        self.inner.close(code, reason.as_bytes());
    }
}

impl transport::SendStream for webtransport_quinn::SendStream {
    fn set_priority(&mut self, order: i64) {
        // The underlying stream takes an i32 send order.
        let order = order.clamp(i32::MIN as i64, i32::MAX as i64) as i32;
        let _ = webtransport_quinn::SendStream::set_priority(self, order);
    }

    fn reset(&mut self, code: u32) {
        let _ = webtransport_quinn::SendStream::reset(self, code);
    }
}

impl transport::RecvStream for webtransport_quinn::RecvStream {
    fn stop(&mut self, code: u32) {
        let _ = webtransport_quinn::RecvStream::stop(self, code);
    }
}
