//! Mock transport for testing
//!
//! Supports two modes: raw injected bytes (like a capture replay), and a
//! scripted command/reply table that answers each written command line with
//! a canned reply, recording the dialogue for assertions.

use super::Transport;
use crate::error::Result;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<Mutex<MockTransportInner>>,
}

struct MockTransportInner {
    read_buffer: VecDeque<u8>,
    write_buffer: Vec<u8>,
    /// (command prefix, reply without trailing CR); first match wins,
    /// consumed once unless sticky
    script: Vec<ScriptEntry>,
    /// Every complete CR-terminated command written, in order
    commands: Vec<String>,
    pending_line: Vec<u8>,
}

struct ScriptEntry {
    prefix: String,
    reply: String,
    sticky: bool,
}

impl MockTransport {
    pub fn new() -> Self {
        MockTransport {
            inner: Arc::new(Mutex::new(MockTransportInner {
                read_buffer: VecDeque::new(),
                write_buffer: Vec::new(),
                script: Vec::new(),
                commands: Vec::new(),
                pending_line: Vec::new(),
            })),
        }
    }

    /// Inject raw data to be read
    pub fn inject_read(&self, data: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        inner.read_buffer.extend(data);
    }

    /// Answer the next command starting with `prefix` with `reply` once.
    pub fn expect(&self, prefix: &str, reply: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.script.push(ScriptEntry {
            prefix: prefix.to_string(),
            reply: reply.to_string(),
            sticky: false,
        });
    }

    /// Answer every command starting with `prefix` with `reply`.
    pub fn expect_always(&self, prefix: &str, reply: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.script.push(ScriptEntry {
            prefix: prefix.to_string(),
            reply: reply.to_string(),
            sticky: true,
        });
    }

    /// All CR-terminated commands written so far
    pub fn commands(&self) -> Vec<String> {
        self.inner.lock().unwrap().commands.clone()
    }

    /// Get all written bytes
    pub fn get_written(&self) -> Vec<u8> {
        self.inner.lock().unwrap().write_buffer.clone()
    }

    pub fn clear_written(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.write_buffer.clear();
        inner.commands.clear();
    }
}

impl MockTransportInner {
    fn answer(&mut self, command: &str) {
        let position = self
            .script
            .iter()
            .position(|e| command.starts_with(&e.prefix));
        if let Some(idx) = position {
            let reply = self.script[idx].reply.clone();
            if !self.script[idx].sticky {
                self.script.remove(idx);
            }
            self.read_buffer.extend(reply.as_bytes());
            self.read_buffer.push_back(b'\r');
        }
    }
}

impl Transport for MockTransport {
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        let available = inner.read_buffer.len().min(buffer.len());

        for item in buffer.iter_mut().take(available) {
            *item = inner.read_buffer.pop_front().unwrap();
        }

        Ok(available)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        inner.write_buffer.extend_from_slice(data);
        for &b in data {
            if b == b'\r' {
                let command = String::from_utf8_lossy(&inner.pending_line).to_string();
                inner.pending_line.clear();
                inner.commands.push(command.clone());
                inner.answer(&command);
            } else {
                inner.pending_line.push(b);
            }
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}
