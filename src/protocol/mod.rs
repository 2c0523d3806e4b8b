//! Wire protocol: typed server events, client actions and the frame decoder.

pub mod actions;
pub mod decoder;
pub mod error;
pub mod events;

pub use actions::ClientAction;
pub use decoder::EventDecoder;
pub use error::ProtocolError;
pub use events::*;
