//! External process invocation.
//!
//! - `handle`: one subprocess with start, stop escalation and exit status
//! - `console`: append-only stdout/stderr text buffers
//! - `signal`: PID and process-group signal helpers

mod console;
mod handle;
mod signal;

pub use console::{Console, ConsoleBuffer, ConsoleStream};
pub use handle::{ProcessExit, ProcessHandle};
