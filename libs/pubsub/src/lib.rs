//! Publish/subscribe control protocol on top of a [`herald_channel::FrameChannel`].
//!
//! Each frame carries one JSON-encoded [`ControlFrame`] tagged by `type`:
//! `SUBSCRIBE`, `PUBLISH`, `DELIVER` or `ERROR`.

mod client;
mod error;
mod wire;

pub use client::{Delivery, PubSubClient};
pub use error::{ClientError, ProtocolError};
pub use wire::ControlFrame;
