//! Wait/signal primitive with safe destruction under live waiters.
//!
//! [`RefSemaphore`] is a counting semaphore that also tracks how many threads
//! are currently blocked inside a wait call. Destruction drains those waiters
//! before the underlying signal backend is released, so a stream or link can
//! be torn down while another thread is still parked on it.
//!
//! The blocking mechanism itself sits behind [`SignalBackend`]. The portable
//! [`CondvarBackend`] is the default; other backends are picked when the
//! semaphore is constructed, never by conditional compilation at call sites.

pub mod backend;
pub mod error;
pub mod semaphore;

pub use backend::{CondvarBackend, SignalBackend, WaitOutcome};
pub use error::{Result, SyncError};
pub use semaphore::{RefSemaphore, DESTROYED_REFS, MAX_COUNT};
