// ABOUTME: Progress snapshots reported by running tasks
// ABOUTME: Tracks value, total and message with percentage helpers

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Progress {
    pub name: String,
    pub value: u64,
    pub total: u64,
    pub message: Option<String>,
}

impl Progress {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: 0,
            total: 100,
            message: None,
        }
    }

    pub fn update(&mut self, value: u64, total: u64, message: Option<String>) {
        self.value = value;
        self.total = total;
        if message.is_some() {
            self.message = message;
        }
    }

    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.value.min(self.total) as f64 / self.total as f64) * 100.0
    }

    pub fn is_done(&self) -> bool {
        self.total > 0 && self.value >= self.total
    }

    /// Sum of several snapshots, used by queues to report their members as one.
    pub fn combine<'a>(name: &str, parts: impl IntoIterator<Item = &'a Progress>) -> Progress {
        let mut combined = Progress::new(name);
        combined.total = 0;
        for part in parts {
            combined.value += part.value.min(part.total);
            combined.total += part.total;
        }
        combined
    }
}
