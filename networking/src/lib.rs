pub mod loopback;
pub mod pipeline;
pub mod sync;
pub mod types;

pub use types::{ConnectionState, InvItem, InvKind, Message, Peer};
