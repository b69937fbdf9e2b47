//! A write handle that never blocks the producer. Bytes are queued through a
//! channel and drained into the underlying stream by a background runner, so
//! a slow link cannot disturb the pacer's timing. The queue carries a byte
//! budget: a stalled peer surfaces as an overflow error on `write`, not as
//! backpressure.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use bytes::Bytes;
use tokio::{io::AsyncWriteExt, sync::mpsc};

use crate::{
    error::{NagareError, NagareResult},
    message::Message,
    transport::SendStream,
};

/// In-flight byte budget per stream.
const BUFFER_MAX: usize = 16 * 1024 * 1024;

enum Command {
    Write(Bytes),
    SetPriority(i64),
    Close,
    Cancel(u32),
}

#[derive(Clone)]
pub struct Stream {
    tx: mpsc::UnboundedSender<Command>,
    buffered: Arc<AtomicUsize>,
    buffer_max: usize,
}

impl Stream {
    pub fn new<S: SendStream>(inner: S) -> (Self, StreamRunner<S>) {
        Self::with_buffer_max(inner, BUFFER_MAX)
    }

    pub fn with_buffer_max<S: SendStream>(inner: S, buffer_max: usize) -> (Self, StreamRunner<S>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let buffered = Arc::new(AtomicUsize::new(0));

        let stream = Self {
            tx,
            buffered: buffered.clone(),
            buffer_max,
        };
        let runner = StreamRunner {
            inner,
            rx,
            buffered,
        };

        (stream, runner)
    }

    /// Append bytes without waiting for the transport.
    pub fn write(&self, data: Bytes) -> NagareResult<()> {
        if data.is_empty() {
            return Ok(());
        }

        let len = data.len();
        if self.buffered.fetch_add(len, Ordering::AcqRel) + len > self.buffer_max {
            self.buffered.fetch_sub(len, Ordering::AcqRel);
            return Err(NagareError::StreamOverflow);
        }

        self.send(Command::Write(data))
    }

    /// Frame and append a control message.
    pub fn write_message(&self, message: &Message) -> NagareResult<()> {
        self.write(message.encode()?)
    }

    pub fn set_priority(&self, order: i64) -> NagareResult<()> {
        self.send(Command::SetPriority(order))
    }

    /// Finish the stream once everything buffered has drained.
    pub fn close(&self) -> NagareResult<()> {
        self.send(Command::Close)
    }

    /// Abandon the stream, discarding anything still buffered.
    pub fn cancel(&self, code: u32) {
        let _ = self.tx.send(Command::Cancel(code));
    }

    fn send(&self, command: Command) -> NagareResult<()> {
        self.tx
            .send(command)
            .map_err(|_| NagareError::StreamClosed)
    }
}

pub struct StreamRunner<S: SendStream> {
    inner: S,
    rx: mpsc::UnboundedReceiver<Command>,
    buffered: Arc<AtomicUsize>,
}

impl<S: SendStream> StreamRunner<S> {
    /// Drain the buffer into the underlying stream, in append order.
    /// Transport errors surface here, not at the write handle.
    pub async fn run(mut self) -> NagareResult<()> {
        while let Some(command) = self.rx.recv().await {
            match command {
                Command::Write(data) => {
                    let result = self.inner.write_all(&data).await;
                    self.buffered.fetch_sub(data.len(), Ordering::AcqRel);
                    result?;
                }
                Command::SetPriority(order) => self.inner.set_priority(order),
                Command::Close => {
                    self.inner.shutdown().await?;
                    return Ok(());
                }
                Command::Cancel(code) => {
                    self.inner.reset(code);
                    return Ok(());
                }
            }
        }

        // Every handle dropped without an explicit close; finish cleanly.
        self.inner.shutdown().await?;
        Ok(())
    }
}
