//! In-process network shaping over a UDP socket: outbound byte-rate pacing,
//! a bounded send queue, and probabilistic loss. Reads pass straight through.
//!
//! This exists to make a single-box demo reproducible; a deployment shapes
//! the link with tc/netem instead (see the shaping loop).

use std::{
    collections::VecDeque,
    io,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use rand::Rng;
use tokio::{
    net::UdpSocket,
    sync::{Mutex, Notify},
};
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct ShapedSocket {
    inner: Arc<UdpSocket>,
    state: Arc<Mutex<ShapeState>>,
    notify: Arc<Notify>,
}

#[derive(Default)]
struct ShapeState {
    /// Outbound bytes per second; 0 means unlimited.
    rate: u64,
    /// Maximum queued bytes before packets are dropped; 0 means unlimited.
    queue_max: usize,
    /// Probability in `[0, 1]` that an outbound packet is dropped.
    loss: f64,

    queue: VecDeque<Packet>,
    queued_bytes: usize,

    last_time: Option<Instant>,
    last_size: usize,

    /// A fatal send error; every later write fails with it.
    error: Option<(io::ErrorKind, String)>,
}

struct Packet {
    addr: SocketAddr,
    data: Bytes,
}

impl ShapedSocket {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        Ok(Self::new(UdpSocket::bind(addr).await?))
    }

    pub fn new(socket: UdpSocket) -> Self {
        Self {
            inner: Arc::new(socket),
            state: Arc::new(Mutex::new(ShapeState::default())),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.inner.recv_from(buf).await
    }

    /// Queue a packet for sending, or send it directly when nothing shapes
    /// the path. Dropped packets still report their length as accepted.
    pub async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        let mut state = self.state.lock().await;

        if let Some((kind, message)) = &state.error {
            return Err(io::Error::new(*kind, message.clone()));
        }

        if state.queue_max > 0 && state.queued_bytes + buf.len() > state.queue_max {
            // Queue is full: the packet is silently dropped.
            return Ok(buf.len());
        }

        if state.queue.is_empty() && state.rate == 0 {
            if !drop_packet(state.loss) {
                // The lock is held across the send so packets leave in
                // caller order even on the unshaped path.
                if let Err(err) = self.inner.send_to(buf, addr).await {
                    state.error = Some((err.kind(), err.to_string()));
                    return Err(err);
                }
            }
            return Ok(buf.len());
        }

        state.queue.push_back(Packet {
            addr,
            data: Bytes::copy_from_slice(buf),
        });
        state.queued_bytes += buf.len();
        self.notify.notify_one();

        Ok(buf.len())
    }

    /// Bytes currently waiting in the outbound queue.
    pub async fn queued_bytes(&self) -> usize {
        self.state.lock().await.queued_bytes
    }

    pub async fn set_write_rate(&self, bytes_per_sec: u64) {
        self.state.lock().await.rate = bytes_per_sec;
        self.notify.notify_one();
    }

    pub async fn set_write_queue_max(&self, bytes: usize) {
        let mut state = self.state.lock().await;
        state.queue_max = bytes;
        if bytes > 0 {
            // Shrinking the cap evicts the most recently queued packets.
            while state.queued_bytes > bytes {
                let packet = state.queue.pop_back().expect("queued bytes without packets");
                state.queued_bytes -= packet.data.len();
            }
        }
        self.notify.notify_one();
    }

    pub async fn set_write_loss(&self, fraction: f64) {
        self.state.lock().await.loss = fraction.clamp(0.0, 1.0);
        self.notify.notify_one();
    }

    /// Drain worker. Paces queued packets by the configured byte rate and
    /// honors `cancel` at every sleep. A send failure latches and ends the
    /// worker.
    pub async fn run(&self, cancel: CancellationToken) -> io::Result<()> {
        enum Action {
            Wait,
            Sleep(Duration),
        }

        loop {
            // Created before the state check so a wake between unlock and
            // await is not lost.
            let notified = self.notify.notified();

            let action = {
                let mut state = self.state.lock().await;
                if state.queue.is_empty() {
                    Action::Wait
                } else if let Some(delay) = release_delay(&state) {
                    Action::Sleep(delay)
                } else {
                    let packet = state.queue.pop_front().expect("non-empty queue");
                    state.queued_bytes -= packet.data.len();
                    state.last_time = Some(Instant::now());
                    state.last_size = packet.data.len();

                    if !drop_packet(state.loss) {
                        // The lock stays held across the send so a direct
                        // write cannot overtake the head of the queue.
                        if let Err(err) = self.inner.send_to(&packet.data, packet.addr).await {
                            tracing::warn!(error = %err, "shaped socket send failed");
                            state.error = Some((err.kind(), err.to_string()));
                            return Err(err);
                        }
                    }
                    continue;
                }
            };

            match action {
                Action::Wait => tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = notified => {}
                },
                Action::Sleep(delay) => tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(delay) => {}
                    // A config change re-evaluates the head from scratch.
                    _ = notified => {}
                },
            }
        }
    }
}

/// Time until the head packet may be released, given the previous send.
fn release_delay(state: &ShapeState) -> Option<Duration> {
    let last_time = state.last_time?;
    if state.rate == 0 || state.last_size == 0 {
        return None;
    }

    let gap = Duration::from_nanos(
        (state.last_size as u128 * 1_000_000_000 / state.rate as u128) as u64,
    );
    let delay = (last_time + gap).saturating_duration_since(Instant::now());
    (delay > Duration::ZERO).then_some(delay)
}

fn drop_packet(loss: f64) -> bool {
    loss > 0.0 && rand::thread_rng().gen::<f64>() < loss
}
