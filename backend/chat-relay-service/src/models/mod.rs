pub mod message;
pub mod principal;

pub use message::{ChatMessage, DecodeError, InboundFrame};
pub use principal::Principal;
