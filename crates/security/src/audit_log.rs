//! Append-only audit trail of validation decisions.
//!
//! Every security-relevant rejection lands here with its full reason list,
//! never just a boolean. Memory is bounded: the oldest records roll off
//! once the cap is reached, but within the cap the log is append-only.

use std::collections::VecDeque;

use parking_lot::RwLock;

use fg_domain::AuditRecord;

const DEFAULT_CAP: usize = 10_000;

pub struct AuditLog {
    cap: usize,
    records: RwLock<VecDeque<AuditRecord>>,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAP)
    }
}

impl AuditLog {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            records: RwLock::new(VecDeque::new()),
        }
    }

    pub fn append(&self, record: AuditRecord) {
        let mut records = self.records.write();
        if records.len() == self.cap {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// The most recent `limit` records, newest first.
    pub fn recent(&self, limit: usize) -> Vec<AuditRecord> {
        let records = self.records.read();
        records.iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(session: &str, status: &'static str) -> AuditRecord {
        AuditRecord {
            at: Utc::now(),
            session_id: session.into(),
            kind: "behavioral_signal".into(),
            origin: "http://localhost:3000".into(),
            status,
            reasons: vec![],
        }
    }

    #[test]
    fn recent_returns_newest_first() {
        let log = AuditLog::default();
        log.append(record("a", "accepted"));
        log.append(record("b", "rejected"));
        let recent = log.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].session_id, "b");
    }

    #[test]
    fn cap_rolls_off_oldest() {
        let log = AuditLog::new(3);
        for i in 0..5 {
            log.append(record(&format!("s{i}"), "accepted"));
        }
        assert_eq!(log.len(), 3);
        let recent = log.recent(3);
        assert_eq!(recent[0].session_id, "s4");
        assert_eq!(recent[2].session_id, "s2");
    }
}
