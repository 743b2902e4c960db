//! Console capture buffers.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Which output stream of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsoleStream {
    Out,
    Err,
}

/// Append-only text buffer shared between capture tasks and readers.
#[derive(Debug, Clone, Default)]
pub struct ConsoleBuffer {
    text: Arc<Mutex<String>>,
}

impl ConsoleBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one line; a trailing newline is added.
    pub fn push_line(&self, line: &str) {
        let mut text = self.text.lock();
        text.push_str(line.trim_end_matches(['\r', '\n']));
        text.push('\n');
    }

    pub fn snapshot(&self) -> String {
        self.text.lock().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.text.lock().is_empty()
    }
}

/// Standard output and error buffers of one execution.
#[derive(Debug, Clone, Default)]
pub struct Console {
    pub out: ConsoleBuffer,
    pub err: ConsoleBuffer,
}

impl Console {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stream(&self, stream: ConsoleStream) -> &ConsoleBuffer {
        match stream {
            ConsoleStream::Out => &self.out,
            ConsoleStream::Err => &self.err,
        }
    }
}
