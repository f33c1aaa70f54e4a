//! Protocol-level logging: `logging/setLevel` and `notifications/message`
//! (spec.md §4.7). Independent of the engine's own `tracing` diagnostics.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The eight RFC 5424 syslog levels spec.md §4.7 names, ordered so `>=`
/// implements "do not emit below the selected level" directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Notice,
    Warning,
    Error,
    Critical,
    Alert,
    Emergency,
}

/// Params for `logging/setLevel`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetLevelParams {
    pub level: LogLevel,
}

/// Payload of a `notifications/message` log event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogMessageNotification {
    pub level: LogLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logger: Option<String>,
    pub data: Value,
}

/// Server-side filter state: `None` means "no level set yet, use server
/// default filtering" per spec.md §4.7.
#[derive(Debug, Default)]
pub struct LogFilter {
    selected: Option<LogLevel>,
}

impl LogFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_level(&mut self, level: LogLevel) {
        self.selected = Some(level);
    }

    /// Whether a message at `level` should be suppressed.
    pub fn is_suppressed(&self, level: LogLevel) -> bool {
        match self.selected {
            Some(selected) => level < selected,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_below_selected_level() {
        let mut filter = LogFilter::new();
        filter.set_level(LogLevel::Warning);
        assert!(filter.is_suppressed(LogLevel::Info));
        assert!(!filter.is_suppressed(LogLevel::Error));
        assert!(!filter.is_suppressed(LogLevel::Warning));
    }

    #[test]
    fn no_level_set_never_suppresses() {
        let filter = LogFilter::new();
        assert!(!filter.is_suppressed(LogLevel::Debug));
    }
}
