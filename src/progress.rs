//! Progress reporting for import runs

use serde::Serialize;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageLevel {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressMessage {
    pub level: MessageLevel,
    pub text: String,
}

/// Receives progress from the sequential row loop.
pub trait ProgressSink {
    fn set_total(&mut self, total: usize);
    fn set_progress(&mut self, done: usize);
    fn add_message(&mut self, level: MessageLevel, text: String);
}

/// Keeps every message and forwards it to tracing.
#[derive(Debug)]
pub struct RecordingProgress {
    total: usize,
    done: usize,
    messages: Vec<ProgressMessage>,
    start_time: Instant,
}

impl Default for RecordingProgress {
    fn default() -> Self {
        Self {
            total: 0,
            done: 0,
            messages: Vec::new(),
            start_time: Instant::now(),
        }
    }
}

impl RecordingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[ProgressMessage] {
        &self.messages
    }

    pub fn elapsed_ms(&self) -> u128 {
        self.start_time.elapsed().as_millis()
    }
}

impl ProgressSink for RecordingProgress {
    fn set_total(&mut self, total: usize) {
        self.total = total;
    }

    fn set_progress(&mut self, done: usize) {
        self.done = done;
        if self.total > 0 && done % 500 == 0 {
            tracing::debug!(done, total = self.total, "import progress");
        }
    }

    fn add_message(&mut self, level: MessageLevel, text: String) {
        match level {
            MessageLevel::Info | MessageLevel::Success => tracing::info!("{}", text),
            // Row failures are user data problems, not daemon faults.
            MessageLevel::Warning | MessageLevel::Error => tracing::warn!("{}", text),
        }
        self.messages.push(ProgressMessage { level, text });
    }
}
