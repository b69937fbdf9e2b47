//! One viewer session: pushes init segments and paced audio/video fragments
//! onto prioritized unidirectional streams, and ingests the JSON control
//! channel.

use std::{
    collections::HashMap,
    pin::pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use tokio::io::AsyncReadExt;

use crate::{
    error::NagareResult,
    media::{Media, MediaInit, MediaSegment, MediaStream},
    message::{parse_atom_header, Message, MessageDebug, MessageInit, MessagePong, MessageSegment},
    server::ShapingState,
    stream::Stream,
    tasks::TaskGroup,
    transport::{RecvStream, Transport},
    util::{read_exact_or_eof, unix_millis},
};

/// How often a paused track checks whether streaming resumed.
const PAUSE_POLL: Duration = Duration::from_millis(10);

pub struct Session<T: Transport> {
    transport: T,
    media: Arc<Media>,
    state: Arc<ShapingState>,
    streaming: Arc<AtomicBool>,
    prefs: Arc<Mutex<HashMap<String, String>>>,
}

/// Handles the control decoder needs to act on a message.
struct Control<T: Transport> {
    transport: T,
    state: Arc<ShapingState>,
    streaming: Arc<AtomicBool>,
    prefs: Arc<Mutex<HashMap<String, String>>>,
    tasks: TaskGroup,
}

impl<T: Transport> Clone for Control<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            state: self.state.clone(),
            streaming: self.streaming.clone(),
            prefs: self.prefs.clone(),
            tasks: self.tasks.clone(),
        }
    }
}

impl<T: Transport> Session<T> {
    pub fn new(transport: T, media: Arc<Media>, state: Arc<ShapingState>) -> Self {
        // A new viewer always starts unpaused.
        state.set_streaming(true);

        Self {
            transport,
            media,
            state,
            streaming: Arc::new(AtomicBool::new(true)),
            prefs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Client preferences received so far, by name.
    pub fn preferences(&self) -> Arc<Mutex<HashMap<String, String>>> {
        self.prefs.clone()
    }

    /// Drive the session to completion.
    ///
    /// The broadcast (init push plus both track pumps) and its support
    /// activities (stream accept loops, control handlers) run under one
    /// scope: the first error anywhere cancels everything. When the
    /// broadcast itself finishes, the in-flight stream drains are flushed
    /// and the support loops are dropped, so a viewer holding a control
    /// stream open cannot stall the close.
    pub async fn run(self) -> NagareResult<()> {
        let (inits, audio, video) = self.media.start().await?;

        let (streams, stream_runner) = TaskGroup::new();
        let (handlers, handler_runner) = TaskGroup::new();

        let control = Control {
            transport: self.transport.clone(),
            state: self.state.clone(),
            streaming: self.streaming.clone(),
            prefs: self.prefs.clone(),
            tasks: streams.clone(),
        };

        let broadcast = async {
            tokio::try_join!(
                Self::run_inits(self.transport.clone(), inits, streams.clone()),
                Self::run_track(
                    self.transport.clone(),
                    audio,
                    "audio",
                    self.state.clone(),
                    self.streaming.clone(),
                    streams.clone(),
                ),
                Self::run_track(
                    self.transport.clone(),
                    video,
                    "video",
                    self.state.clone(),
                    self.streaming.clone(),
                    streams.clone(),
                ),
            )
            .map(|_| ())
        };

        let support = async {
            tokio::try_join!(
                Self::run_accept(self.transport.clone()),
                Self::run_accept_uni(self.transport.clone(), control, handlers),
                handler_runner.run(),
            )
            .map(|_| ())
        };

        let mut stream_runner = pin!(stream_runner.run());

        tokio::select! {
            result = &mut stream_runner => return result,
            result = support => return result,
            result = broadcast => result?,
        };

        // Clean end of media. The select dropped the accept loops and the
        // control handlers with their task-group handles; once ours goes
        // too, the runner finishes after the buffered drains flush.
        drop(streams);
        stream_runner.await
    }

    /// The protocol has no bidirectional application streams; cancel the
    /// read side of any the client opens, without failing the session.
    async fn run_accept(mut transport: T) -> NagareResult<()> {
        loop {
            let (_send, mut recv) = transport.accept_bi().await?;
            recv.stop(1);
        }
    }

    async fn run_accept_uni(
        mut transport: T,
        control: Control<T>,
        handlers: TaskGroup,
    ) -> NagareResult<()> {
        loop {
            let recv = transport.accept_uni().await?;
            handlers.spawn(Self::handle_control(recv, control.clone()));
        }
    }

    /// Decode `warp` atoms off one control stream. Malformed input cancels
    /// this stream and the session carries on; a session-level transport
    /// failure (for example a pong stream that cannot be opened) propagates.
    async fn handle_control(mut recv: T::RecvStream, mut control: Control<T>) -> NagareResult<()> {
        loop {
            let mut header = [0u8; 8];
            let message = async {
                if !read_exact_or_eof(&mut recv, &mut header).await? {
                    return Ok(None);
                }
                let payload_len = parse_atom_header(&header)?;
                let mut payload = vec![0u8; payload_len];
                recv.read_exact(&mut payload).await?;
                Message::decode(&payload).map(Some)
            }
            .await;

            let message = match message {
                Ok(Some(message)) => message,
                Ok(None) => return Ok(()),
                Err(err) => {
                    tracing::warn!(error = %err, "cancelling control stream");
                    recv.stop(1);
                    return Ok(());
                }
            };

            tracing::debug!(?message, "received message");
            control.dispatch(message).await?;
        }
    }

    async fn run_inits(
        mut transport: T,
        inits: HashMap<String, Arc<MediaInit>>,
        tasks: TaskGroup,
    ) -> NagareResult<()> {
        for init in inits.values() {
            let send = transport.open_uni().await?;
            let (stream, runner) = Stream::new(send);
            tasks.spawn(runner.run());

            let result = (|| {
                // Init segments outrank every media segment.
                stream.set_priority(i64::MAX)?;
                stream.write_message(&Message {
                    init: Some(MessageInit {
                        id: init.id.clone(),
                    }),
                    ..Default::default()
                })?;
                stream.write(init.raw.clone())?;
                stream.close()
            })();

            if result.is_err() {
                stream.cancel(1);
                return result;
            }
        }

        Ok(())
    }

    async fn run_track(
        mut transport: T,
        mut track: MediaStream,
        label: &'static str,
        state: Arc<ShapingState>,
        streaming: Arc<AtomicBool>,
        tasks: TaskGroup,
    ) -> NagareResult<()> {
        // Time spent paused; shifts every later fragment's pacing deadline.
        let mut pause_offset = Duration::ZERO;

        loop {
            if !streaming.load(Ordering::Acquire) {
                let tick = Instant::now();
                tokio::time::sleep(PAUSE_POLL).await;
                pause_offset += tick.elapsed();
                continue;
            }

            let Some(mut segment) = track.next(pause_offset).await? else {
                tracing::info!(track = label, "end of stream");
                return Ok(());
            };

            Self::write_segment(&mut transport, &mut segment, &state, &tasks).await?;
        }
    }

    /// Open a stream for one segment: framing message first, then the fMP4
    /// boxes as the pacer releases them.
    async fn write_segment(
        transport: &mut T,
        segment: &mut MediaSegment,
        state: &ShapingState,
        tasks: &TaskGroup,
    ) -> NagareResult<()> {
        let send = transport.open_uni().await?;
        let (stream, runner) = Stream::new(send);
        tasks.spawn(runner.run());

        let timestamp = segment.timestamp.as_millis() as u64;

        let result = async {
            // Newer segments outrank older ones in the congestion window.
            stream.set_priority(timestamp as i64)?;

            stream.write_message(&Message {
                segment: Some(MessageSegment {
                    init: segment.init().id.clone(),
                    timestamp,
                    etp: transport.max_bandwidth() / 1024,
                    tc_rate: state.report_rate(),
                    at: unix_millis(),
                }),
                ..Default::default()
            })?;

            while let Some(chunk) = segment.read().await? {
                // Never blocks; a stalled peer surfaces as an overflow error.
                stream.write(chunk)?;
            }

            stream.close()
        }
        .await;

        if result.is_err() {
            stream.cancel(1);
        }
        result
    }
}

impl<T: Transport> Control<T> {
    async fn dispatch(&mut self, message: Message) -> NagareResult<()> {
        if let Some(init) = &message.init {
            // Handshake placeholder; nothing to act on server-side.
            tracing::debug!(id = %init.id, "client init");
        }

        if let Some(debug) = &message.debug {
            self.set_debug(debug);
        }

        if let Some(pref) = message.pref {
            tracing::info!(name = %pref.name, value = %pref.value, "preference received");
            self.prefs
                .lock()
                .unwrap()
                .insert(pref.name, pref.value);
        }

        if message.ping.is_some() {
            self.send_pong().await?;
        }

        Ok(())
    }

    fn set_debug(&self, debug: &MessageDebug) {
        if let Some(max_bitrate) = debug.max_bitrate {
            self.transport.set_max_bandwidth(max_bitrate);
        }

        if let Some(streaming) = debug.continue_streaming {
            self.streaming.store(streaming, Ordering::Release);
            self.state.set_streaming(streaming);
        }

        // Only an explicit `true` asks for a reset.
        if debug.tc_reset == Some(true) {
            self.state.request_tc_reset();
        }
    }

    async fn send_pong(&mut self) -> NagareResult<()> {
        let send = self.transport.open_uni().await?;
        let (stream, runner) = Stream::new(send);
        self.tasks.spawn(runner.run());

        let result = stream
            .write_message(&Message {
                pong: Some(MessagePong {}),
                ..Default::default()
            })
            .and_then(|_| stream.close());

        if result.is_err() {
            stream.cancel(1);
        }
        result
    }
}
