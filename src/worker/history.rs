//! Fixed-size rings of recent payouts and recent votes
//!
//! They let a restarted loop recognise work it has already done before the
//! store reflects it. Entries fall off the back once the ring is full.

use crate::mpc::AcceptResult;
use crate::swap::SwapKey;

use std::collections::VecDeque;
use std::sync::Mutex;

/// Recently dispatched `swap key -> payout hash` pairs
pub struct SwapHistory {
    capacity: usize,
    entries: Mutex<VecDeque<(SwapKey, String)>>,
}

impl SwapHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        }
    }

    pub fn add(&self, key: SwapKey, swap_tx: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back((key, swap_tx.to_lowercase()));
    }

    /// Latest payout hash dispatched for `key`
    pub fn get(&self, key: &SwapKey) -> Option<String> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, tx)| tx.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// A vote this node already cast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptRecord {
    pub key_id: String,
    pub result: AcceptResult,
    pub msg_hashes: Vec<String>,
    pub msg_contexts: Vec<String>,
}

/// Recently decided sign requests
pub struct AcceptHistory {
    capacity: usize,
    entries: Mutex<VecDeque<AcceptRecord>>,
}

impl AcceptHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        }
    }

    pub fn add(&self, record: AcceptRecord) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|r| r.key_id != record.key_id);
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(record);
    }

    pub fn get(&self, key_id: &str) -> Option<AcceptRecord> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.iter().find(|r| r.key_id == key_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_swap_history_ring() {
        let history = SwapHistory::new(2);
        let k1 = SwapKey::new(1, "0x01", 0);
        let k2 = SwapKey::new(1, "0x02", 0);
        let k3 = SwapKey::new(1, "0x03", 0);

        history.add(k1.clone(), "0xA1");
        history.add(k2.clone(), "0xa2");
        assert_eq!(history.get(&k1), Some("0xa1".to_string()));

        history.add(k3.clone(), "0xa3");
        assert_eq!(history.len(), 2);
        assert_eq!(history.get(&k1), None);
        assert_eq!(history.get(&k3), Some("0xa3".to_string()));

        history.add(k3.clone(), "0xb3");
        assert_eq!(history.get(&k3), Some("0xb3".to_string()));
    }

    #[test]
    fn test_accept_history_keeps_latest_decision() {
        let history = AcceptHistory::new(2);
        let record = |id: &str, result| AcceptRecord {
            key_id: id.to_string(),
            result,
            msg_hashes: vec!["0xh".into()],
            msg_contexts: vec!["{}".into()],
        };

        history.add(record("a", AcceptResult::Ignore));
        history.add(record("a", AcceptResult::Agree));
        history.add(record("b", AcceptResult::Disagree));
        assert_eq!(history.get("a").unwrap().result, AcceptResult::Agree);

        history.add(record("c", AcceptResult::Agree));
        assert!(history.get("a").is_none());
        assert!(history.get("b").is_some());
    }
}
