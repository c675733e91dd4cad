//! Device-level API
//!
//! - [`Cba4`]: blocking session with one instrument, safe to share between threads
//! - [`AsyncCba4`]: the same session for async callers
//! - [`capabilities`]: async traits implemented by [`AsyncCba4`]

pub mod capabilities;
pub mod cba4;
pub mod cba4_async;

pub use capabilities::{LoadControl, Readable};
pub use cba4::Cba4;
pub use cba4_async::AsyncCba4;
