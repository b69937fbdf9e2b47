#![allow(dead_code)]

//! Shared test plumbing: fMP4 fixture builders, an on-disk DASH asset
//! writer, and an in-memory transport double built on `tokio::io::duplex`.

use std::{
    path::{Path, PathBuf},
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex as StdMutex,
    },
    task::{Context, Poll},
    time::Instant,
};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::{mpsc, Mutex};

use nagare::{
    message::Message,
    transport::{RecvStream, SendStream, Transport},
    NagareError, NagareResult,
};

// ---------------------------------------------------------------------------
// fMP4 fixtures

pub fn make_box(name: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + body.len());
    out.extend_from_slice(&((8 + body.len()) as u32).to_be_bytes());
    out.extend_from_slice(name);
    out.extend_from_slice(body);
    out
}

fn mdhd(timescale: u32) -> Vec<u8> {
    let mut body = vec![0u8; 4];
    body.extend_from_slice(&[0u8; 8]);
    body.extend_from_slice(&timescale.to_be_bytes());
    body.extend_from_slice(&[0u8; 8]);
    make_box(b"mdhd", &body)
}

/// A minimal init segment: `ftyp` plus a `moov` whose single track carries
/// the given timescale.
pub fn init_segment(timescale: u32) -> Vec<u8> {
    [
        make_box(b"ftyp", b"iso5"),
        make_box(
            b"moov",
            &make_box(b"trak", &make_box(b"mdia", &mdhd(timescale))),
        ),
    ]
    .concat()
}

/// One `moof`+`mdat` pair whose first sample decodes at `dts` ticks.
pub fn media_fragment(dts: u64, payload: &[u8]) -> Vec<u8> {
    let mut tfdt = vec![1u8, 0, 0, 0];
    tfdt.extend_from_slice(&dts.to_be_bytes());

    [
        make_box(b"moof", &make_box(b"traf", &make_box(b"tfdt", &tfdt))),
        make_box(b"mdat", payload),
    ]
    .concat()
}

pub fn manifest_xml(timescale: u32, duration: u64) -> String {
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="dynamic" profiles="urn:mpeg:dash:profile:isoff-live:2011">
  <Period>
    <AdaptationSet>
      <Representation id="audio" mimeType="audio/mp4" bandwidth="128000">
        <SegmentTemplate initialization="$RepresentationID$_init.mp4" media="$RepresentationID$_$Number%05d$.m4s" timescale="{timescale}" duration="{duration}" startNumber="1"/>
      </Representation>
    </AdaptationSet>
    <AdaptationSet>
      <Representation id="video" mimeType="video/mp4" bandwidth="3000000">
        <SegmentTemplate initialization="$RepresentationID$_init.mp4" media="$RepresentationID$_$Number%05d$.m4s" timescale="{timescale}" duration="{duration}" startNumber="1"/>
      </Representation>
    </AdaptationSet>
  </Period>
</MPD>
"#
    )
}

/// Write a complete asset into `dir`: manifest, init per track, and
/// `count` numbered segments per track starting at 1, each `duration`
/// ticks long. Returns the manifest path.
pub fn write_media(dir: &Path, timescale: u32, duration: u64, count: u64) -> PathBuf {
    let manifest = dir.join("manifest.mpd");
    std::fs::write(&manifest, manifest_xml(timescale, duration)).unwrap();

    for track in ["audio", "video"] {
        std::fs::write(dir.join(format!("{track}_init.mp4")), init_segment(timescale)).unwrap();

        for number in 1..=count {
            let dts = (number - 1) * duration;
            std::fs::write(
                dir.join(format!("{track}_{number:05}.m4s")),
                media_fragment(dts, &[0xab; 64]),
            )
            .unwrap();
        }
    }

    manifest
}

// ---------------------------------------------------------------------------
// In-memory transport double

pub struct TestSendStream {
    inner: DuplexStream,
    priority: Arc<StdMutex<Option<i64>>>,
}

impl AsyncWrite for TestSendStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl SendStream for TestSendStream {
    fn set_priority(&mut self, order: i64) {
        *self.priority.lock().unwrap() = Some(order);
    }

    fn reset(&mut self, _code: u32) {}
}

pub struct TestRecvStream {
    inner: DuplexStream,
}

impl AsyncRead for TestRecvStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl RecvStream for TestRecvStream {
    fn stop(&mut self, _code: u32) {}
}

/// A stream the server opened, as observed by the test.
pub struct OpenedStream {
    pub recv: DuplexStream,
    pub priority: Arc<StdMutex<Option<i64>>>,
    pub opened_at: Instant,
}

struct Inner {
    opened_tx: mpsc::UnboundedSender<OpenedStream>,
    uni_rx: Mutex<mpsc::UnboundedReceiver<TestRecvStream>>,
    bi_rx: Mutex<mpsc::UnboundedReceiver<(TestSendStream, TestRecvStream)>>,
    max_bandwidth: AtomicU64,
    closed: StdMutex<Option<(u32, String)>>,
}

#[derive(Clone)]
pub struct TestTransport {
    inner: Arc<Inner>,
}

impl Transport for TestTransport {
    type SendStream = TestSendStream;
    type RecvStream = TestRecvStream;

    async fn accept_uni(&mut self) -> NagareResult<TestRecvStream> {
        let mut rx = self.inner.uni_rx.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| NagareError::Transport("session closed".into()))
    }

    async fn accept_bi(&mut self) -> NagareResult<(TestSendStream, TestRecvStream)> {
        let mut rx = self.inner.bi_rx.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| NagareError::Transport("session closed".into()))
    }

    async fn open_uni(&mut self) -> NagareResult<TestSendStream> {
        let (local, remote) = tokio::io::duplex(1 << 20);
        let priority = Arc::new(StdMutex::new(None));

        let send = TestSendStream {
            inner: local,
            priority: priority.clone(),
        };
        let _ = self.inner.opened_tx.send(OpenedStream {
            recv: remote,
            priority,
            opened_at: Instant::now(),
        });

        Ok(send)
    }

    fn max_bandwidth(&self) -> u64 {
        self.inner.max_bandwidth.load(Ordering::Acquire)
    }

    fn set_max_bandwidth(&self, bytes_per_sec: u64) {
        self.inner.max_bandwidth.store(bytes_per_sec, Ordering::Release);
    }

    fn close(&self, code: u32, reason: &str) {
        *self.inner.closed.lock().unwrap() = Some((code, reason.to_string()));
    }
}

pub struct TestTransportHandle {
    pub opened: mpsc::UnboundedReceiver<OpenedStream>,
    pub uni_tx: mpsc::UnboundedSender<TestRecvStream>,
    pub bi_tx: mpsc::UnboundedSender<(TestSendStream, TestRecvStream)>,
    transport: TestTransport,
}

impl TestTransportHandle {
    /// Open a unidirectional stream towards the server; returns the write
    /// half the test feeds atoms into.
    pub fn open_control(&self) -> DuplexStream {
        let (local, remote) = tokio::io::duplex(1 << 20);
        self.uni_tx
            .send(TestRecvStream { inner: remote })
            .expect("session gone");
        local
    }

    pub fn closed(&self) -> Option<(u32, String)> {
        self.transport.inner.closed.lock().unwrap().clone()
    }
}

pub fn test_transport() -> (TestTransport, TestTransportHandle) {
    let (opened_tx, opened) = mpsc::unbounded_channel();
    let (uni_tx, uni_rx) = mpsc::unbounded_channel();
    let (bi_tx, bi_rx) = mpsc::unbounded_channel();

    let transport = TestTransport {
        inner: Arc::new(Inner {
            opened_tx,
            uni_rx: Mutex::new(uni_rx),
            bi_rx: Mutex::new(bi_rx),
            max_bandwidth: AtomicU64::new(0),
            closed: StdMutex::new(None),
        }),
    };

    let handle = TestTransportHandle {
        opened,
        uni_tx,
        bi_tx,
        transport: transport.clone(),
    };

    (transport, handle)
}

/// Everything observed on one server-opened stream: the priority it was
/// given, its framing message, and the raw bytes that followed.
pub struct FramedStream {
    pub priority: Option<i64>,
    pub message: Message,
    pub rest: Vec<u8>,
    pub opened_at: Instant,
}

pub async fn read_framed(mut stream: OpenedStream) -> FramedStream {
    let mut header = [0u8; 8];
    stream.recv.read_exact(&mut header).await.unwrap();

    let size = u32::from_be_bytes(header[0..4].try_into().unwrap()) as usize;
    assert_eq!(&header[4..8], b"warp", "stream must start with a warp atom");

    let mut payload = vec![0u8; size - 8];
    stream.recv.read_exact(&mut payload).await.unwrap();
    let message = Message::decode(&payload).unwrap();

    let mut rest = Vec::new();
    stream.recv.read_to_end(&mut rest).await.unwrap();

    let priority = *stream.priority.lock().unwrap();
    FramedStream {
        priority,
        message,
        rest,
        opened_at: stream.opened_at,
    }
}
