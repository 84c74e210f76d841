//! `taskmill-core`: primitives shared by the queue, scheduler and cache layers.
//!
//! This crate is **pure** (no I/O): identifiers, the clock abstraction and the
//! core error type.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::{CoreError, CoreResult};
pub use id::{JobId, WorkerId};
