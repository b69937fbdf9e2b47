#![allow(async_fn_in_trait)]

//! Live fMP4 origin core.
//!
//! Replays an on-disk DASH asset at wall-clock pace and delivers it to a
//! viewer over prioritized unidirectional streams, one segment per stream,
//! with a small JSON control channel riding the same session. The transport
//! itself stays behind the traits in [`transport`].

pub mod error;
pub mod media;
pub mod message;
pub mod server;
pub mod session;
pub mod shaper;
pub mod socket;
pub mod stream;
pub mod tasks;
pub mod transport;

mod util;

pub use error::{NagareError, NagareResult};
pub use media::Media;
pub use server::{serve, ShapingState};
pub use session::Session;
pub use socket::ShapedSocket;
