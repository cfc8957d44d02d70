//! Work completions polled from a completion queue.

mod wc;

pub use self::wc::*;
