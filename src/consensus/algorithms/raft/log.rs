//! Replicated log with 1-based indices

use serde::{Deserialize, Serialize};

pub type Term = u64;
pub type LogIndex = u64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub index: LogIndex,
    pub command: serde_json::Value,
}

#[derive(Debug, Clone, Default)]
pub struct RaftLog {
    entries: Vec<LogEntry>,
}

impl RaftLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<LogEntry>) -> Self {
        Self { entries }
    }

    pub fn last_index(&self) -> LogIndex {
        self.entries.len() as LogIndex
    }

    pub fn last_term(&self) -> Term {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    /// Term at `index`; index 0 is the empty prefix with term 0
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        self.get(index).map(|e| e.term)
    }

    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get((index - 1) as usize)
    }

    pub fn append(&mut self, term: Term, command: serde_json::Value) -> LogEntry {
        let entry = LogEntry {
            term,
            index: self.last_index() + 1,
            command,
        };
        self.entries.push(entry.clone());
        entry
    }

    /// Drop every entry at `index` and after
    pub fn truncate_from(&mut self, index: LogIndex) {
        if index == 0 {
            self.entries.clear();
        } else {
            self.entries.truncate((index - 1) as usize);
        }
    }

    pub fn entries_from(&self, index: LogIndex) -> Vec<LogEntry> {
        let start = index.max(1) as usize - 1;
        self.entries.get(start..).map(|s| s.to_vec()).unwrap_or_default()
    }

    pub fn slice(&self, from: LogIndex, to: LogIndex) -> Vec<LogEntry> {
        (from.max(1)..=to)
            .filter_map(|index| self.get(index).cloned())
            .collect()
    }

    /// Whether a candidate's log is at least as up to date as ours
    pub fn is_up_to_date(&self, last_index: LogIndex, last_term: Term) -> bool {
        (last_term, last_index) >= (self.last_term(), self.last_index())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
