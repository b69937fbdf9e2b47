//! The QUIC/WebTransport boundary. The session engine is generic over these
//! traits; a real binding lives elsewhere and test doubles live with the
//! tests. Byte-level I/O rides the tokio `AsyncRead`/`AsyncWrite` traits so
//! the usual `read_exact`/`write_all` extensions apply.

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::NagareResult;

/// One accepted WebTransport session.
pub trait Transport: Clone + Send + Sync + 'static {
    type SendStream: SendStream;
    type RecvStream: RecvStream;

    fn accept_uni(
        &mut self,
    ) -> impl std::future::Future<Output = NagareResult<Self::RecvStream>> + Send;
    fn accept_bi(
        &mut self,
    ) -> impl std::future::Future<Output = NagareResult<(Self::SendStream, Self::RecvStream)>> + Send;
    fn open_uni(&mut self) -> impl std::future::Future<Output = NagareResult<Self::SendStream>> + Send;

    /// Current outbound bandwidth cap in bytes per second.
    fn max_bandwidth(&self) -> u64;
    fn set_max_bandwidth(&self, bytes_per_sec: u64);

    fn close(&self, code: u32, reason: &str);
}

/// Outgoing unidirectional stream. Higher priority values are more urgent.
pub trait SendStream: AsyncWrite + Unpin + Send + 'static {
    fn set_priority(&mut self, order: i64);
    fn reset(&mut self, code: u32);
}

/// Incoming unidirectional stream.
pub trait RecvStream: AsyncRead + Unpin + Send + 'static {
    fn stop(&mut self, code: u32);
}
