use std::collections::BTreeMap;
use std::fmt::Write;

use regtest_common::p2p::NetworkMessage;

/// Everything a connection has received, keyed by command.
///
/// Counters only grow and the last-message slot of a command is overwritten
/// by every new message of that command. Neither is ever reset while the
/// connection lives.
#[derive(Debug, Clone, Default)]
pub struct MessageLog {
    counts: BTreeMap<String, u64>,
    last: BTreeMap<String, NetworkMessage>,
    total: u64,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, message: &NetworkMessage) {
        let command = message.command();
        *self.counts.entry(command.to_string()).or_insert(0) += 1;
        self.last.insert(command.to_string(), message.clone());
        self.total += 1;
    }

    pub fn count(&self, command: &str) -> u64 {
        self.counts.get(command).copied().unwrap_or(0)
    }

    pub fn last(&self, command: &str) -> Option<&NetworkMessage> {
        self.last.get(command)
    }

    pub fn has(&self, command: &str) -> bool {
        self.count(command) > 0
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// One line per command, used in timeout diagnostics.
    pub fn summary(&self) -> String {
        if self.counts.is_empty() {
            return "no messages received".to_string();
        }

        let mut out = String::new();
        for (command, count) in &self.counts {
            if !out.is_empty() {
                out.push_str("; ");
            }
            let _ = write!(out, "{} x{}", command, count);
            if let Some(last) = self.last.get(command) {
                let _ = write!(out, " (last: {})", last);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_are_monotonic_and_last_wins() {
        let mut log = MessageLog::new();
        log.record(&NetworkMessage::Ping(1));
        log.record(&NetworkMessage::Ping(2));
        log.record(&NetworkMessage::Verack);

        assert_eq!(log.count("ping"), 2);
        assert_eq!(log.count("verack"), 1);
        assert_eq!(log.count("pong"), 0);
        assert_eq!(log.last("ping"), Some(&NetworkMessage::Ping(2)));
        assert_eq!(log.total(), 3);
        assert!(!log.has("pong"));
    }

    #[test]
    fn test_summary() {
        let mut log = MessageLog::new();
        assert_eq!(log.summary(), "no messages received");

        log.record(&NetworkMessage::Pong(7));
        log.record(&NetworkMessage::Verack);
        assert_eq!(log.summary(), "pong x1 (last: pong(nonce=7)); verack x1 (last: verack)");
    }
}
