//! # Models
//!
//! Location records, their wire shape, channel state and the consumer-facing view.

pub mod channel;
pub mod location;
pub mod view;
pub mod wire;

pub use channel::{ChannelPhase, ChannelState, ConnectionHealth};
pub use location::{LocationPatch, LocationRecord, Position, ResponderStatus, UNKNOWN_DISPLAY_NAME};
pub use view::{ActiveView, Viewport};
pub use wire::LocationRow;
