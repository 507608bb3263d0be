//! Framed duplex transport.
//!
//! Frames are `[u32 BE length][payload]` over TCP. A connecting
//! [`FrameChannel`] keeps redialing its peer after a drop and announces
//! [`ChannelEvent::Reconnected`] so protocols on top can restore state;
//! a [`FrameListener`] hands out one channel per inbound connection.

mod channel;
mod error;
pub mod framing;
mod listener;

pub use channel::{
    ChannelEvent, ChannelOptions, FrameChannel, FrameReceiver, FrameSender, Role,
    DEFAULT_RETRY_INTERVAL,
};
pub use error::ChannelError;
pub use framing::DEFAULT_MAX_FRAME_LEN;
pub use listener::FrameListener;
