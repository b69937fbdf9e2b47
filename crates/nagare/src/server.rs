//! State shared between sessions and the shaping loop, and the per-session
//! close policy.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use crate::{error::NagareResult, media::Media, session::Session, transport::Transport};

/// Shaper rate value signalling that a reset has been requested.
pub const TC_RESET_REQUESTED: f64 = -1.0;

/// Traffic-shaping state shared across sessions and the shaping loop.
///
/// A single-viewer demo keeps this process-wide: whoever paused last, paused
/// everyone. All fields are plain atomics; the rate is an `f64` stored as
/// bits.
#[derive(Debug)]
pub struct ShapingState {
    tc_rate: AtomicU64,
    tc_active: AtomicBool,
    streaming: AtomicBool,
}

impl ShapingState {
    pub fn new() -> Self {
        Self {
            tc_rate: AtomicU64::new(TC_RESET_REQUESTED.to_bits()),
            tc_active: AtomicBool::new(false),
            streaming: AtomicBool::new(true),
        }
    }

    /// Applied shaper rate in Mbps; [`TC_RESET_REQUESTED`] while a reset is
    /// pending.
    pub fn tc_rate(&self) -> f64 {
        f64::from_bits(self.tc_rate.load(Ordering::Acquire))
    }

    pub fn set_tc_rate(&self, mbps: f64) {
        self.tc_rate.store(mbps.to_bits(), Ordering::Release);
    }

    pub fn tc_reset_requested(&self) -> bool {
        self.tc_rate() == TC_RESET_REQUESTED
    }

    /// Ask the shaping loop to undo any applied throttle. Also reactivates
    /// streaming so a paused player does not wedge the loop.
    pub fn request_tc_reset(&self) {
        self.set_tc_rate(TC_RESET_REQUESTED);
        self.set_tc_active(false);
        self.set_streaming(true);
    }

    /// Rate to report to the player in kbps; 0 while a reset is pending.
    pub fn report_rate(&self) -> f64 {
        let rate = self.tc_rate();
        if rate == TC_RESET_REQUESTED {
            0.0
        } else {
            rate * 1024.0
        }
    }

    pub fn is_tc_active(&self) -> bool {
        self.tc_active.load(Ordering::Acquire)
    }

    pub fn set_tc_active(&self, active: bool) {
        self.tc_active.store(active, Ordering::Release);
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }

    pub fn set_streaming(&self, streaming: bool) {
        self.streaming.store(streaming, Ordering::Release);
    }
}

impl Default for ShapingState {
    fn default() -> Self {
        Self::new()
    }
}

/// Run one viewer session to completion and close the transport with the
/// outcome: code 0 "end of broadcast" on a clean end, code 1 with the error
/// text otherwise.
pub async fn serve<T: Transport>(
    transport: T,
    media: Arc<Media>,
    state: Arc<ShapingState>,
) -> NagareResult<()> {
    // A fresh viewer starts from an unshaped link; give the shaping loop a
    // moment to apply the reset before media starts flowing.
    state.set_tc_active(true);
    state.set_tc_rate(TC_RESET_REQUESTED);
    tokio::time::sleep(Duration::from_secs(1)).await;

    let session = Session::new(transport.clone(), media, state);
    match session.run().await {
        Ok(()) => {
            tracing::info!("end of broadcast");
            transport.close(0, "end of broadcast");
            Ok(())
        }
        Err(err) => {
            tracing::warn!(error = %err, "session terminated");
            transport.close(1, &err.to_string());
            Err(err)
        }
    }
}
