//! Core conversation types.

pub mod message;
pub mod stream;
pub mod usage;

pub use message::*;
pub use stream::*;
pub use usage::*;
