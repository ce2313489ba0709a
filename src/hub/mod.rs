//! Chat hub module
//!
//! Tracks the live connections and fans every chat message out to all of them.

mod coordinator;
mod member;

pub use coordinator::*;
pub use member::*;
