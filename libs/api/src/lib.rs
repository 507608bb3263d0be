//! Shared vocabulary of the herald broker: payloads, messages and topic names.
//!
//! Every other crate in the workspace depends on this one; it carries no
//! runtime dependencies (no tokio) so both the broker and the client side
//! can share the same types.

mod error;
mod topic;
mod types;
mod util;

pub use error::ApiError;
pub use topic::{validate_topic_name, MAX_TOPIC_NAME_LEN};
pub use types::{Epoch, Message, Payload, Sequence};
pub use util::now_ms;
