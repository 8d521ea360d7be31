// Bounded in-memory history of published events, queried by the
// meta-service's get_logs operation.
use std::collections::VecDeque;

use regex::Regex;

struct LogEntry {
    event: String,
    data: String,
}

pub(crate) struct LogHistory {
    entries: VecDeque<LogEntry>,
    capacity: usize,
}

impl LogHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity,
        }
    }

    /// Record a published event. Oldest entries are dropped once the history
    /// is full; nothing is persisted.
    pub fn record(&mut self, event: &str, data: &[u8]) {
        self.entries.push_back(LogEntry {
            event: event.to_string(),
            data: String::from_utf8_lossy(data).into_owned(),
        });
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    /// Lines whose event name matches `pattern`, oldest first.
    pub fn matching(&self, pattern: &Regex) -> Vec<String> {
        self.entries
            .iter()
            .filter(|entry| pattern.is_match(&entry.event))
            .map(|entry| format!("{}: {}", entry.event, entry.data))
            .collect()
    }
}
