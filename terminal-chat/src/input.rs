//! Line input for the client.
//!
//! Reading a typed line blocks, so it happens on a dedicated thread that
//! hands each finished line to the async side through a [`LineSlot`].

use std::{
    io::{self, BufRead},
    sync::{Arc, Mutex, PoisonError},
    thread::{self, JoinHandle},
};

use tracing::debug;

/// Single-element mailbox shared by the input thread and the send loop.
///
/// Lossy on purpose: a line written before the previous one was taken
/// replaces it.
#[derive(Debug, Clone, Default)]
pub struct LineSlot {
    pending: Arc<Mutex<Option<String>>>,
}

impl LineSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `line`, returning the unsent line it displaced, if any.
    pub fn put(&self, line: String) -> Option<String> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(line)
    }

    pub fn take(&self) -> Option<String> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Spawns the thread that copies non-empty lines from `reader` into `slot`
/// until end of input.
pub fn spawn_line_reader<R>(reader: R, slot: LineSlot) -> io::Result<JoinHandle<()>>
where
    R: BufRead + Send + 'static,
{
    thread::Builder::new()
        .name("keyboard-input".into())
        .spawn(move || read_lines(reader, &slot))
}

fn read_lines<R: BufRead>(reader: R, slot: &LineSlot) {
    for line in reader.lines() {
        match line {
            Ok(line) => {
                let line = line.trim_end_matches(['\r', '\n']);
                if line.trim().is_empty() {
                    continue;
                }
                if let Some(dropped) = slot.put(line.to_string()) {
                    debug!(dropped = %dropped, "unsent line replaced by newer input");
                }
            }
            Err(err) => {
                debug!(error = ?err, "stopped reading input");
                break;
            }
        }
    }
}
