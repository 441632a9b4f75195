//! Reference-counted mirror of the subscriptions local applications hold.
//!
//! Only the first subscriber of a message id and the removal of the last
//! one are visible to peers; everything in between just moves the counter.

use crate::msgids::EVS_EVENT_MSG_MID;
use crate::wire::{MsgId, Qos};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalSubscription {
    pub msg_id: MsgId,
    pub qos: Qos,
    pub in_use_ctr: u32,
}

/// Outcome of recording a local subscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// 0 → 1: peers must be told.
    Added,
    /// Already known; counter bumped.
    Incremented(u32),
    /// Event messages never leave the node.
    Ignored,
    /// New id but the table is full.
    TableFull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsubscribeOutcome {
    /// 1 → 0: peers must be told.
    Removed(LocalSubscription),
    Decremented(u32),
    NotFound,
}

#[derive(Debug, Clone)]
pub struct LocalSubTable {
    entries: Vec<LocalSubscription>,
    capacity: usize,
}

impl LocalSubTable {
    pub fn new(capacity: usize) -> Self {
        Self { entries: Vec::with_capacity(capacity), capacity }
    }

    pub fn subscribe(&mut self, msg_id: MsgId, qos: Qos) -> SubscribeOutcome {
        if msg_id == EVS_EVENT_MSG_MID {
            return SubscribeOutcome::Ignored;
        }
        if let Some(entry) = self.entries.iter_mut().find(|e| e.msg_id == msg_id) {
            entry.in_use_ctr += 1;
            return SubscribeOutcome::Incremented(entry.in_use_ctr);
        }
        if self.entries.len() >= self.capacity {
            return SubscribeOutcome::TableFull;
        }
        self.entries.push(LocalSubscription { msg_id, qos, in_use_ctr: 1 });
        SubscribeOutcome::Added
    }

    pub fn unsubscribe(&mut self, msg_id: MsgId) -> UnsubscribeOutcome {
        let Some(idx) = self.entries.iter().position(|e| e.msg_id == msg_id) else {
            return UnsubscribeOutcome::NotFound;
        };
        let entry = &mut self.entries[idx];
        entry.in_use_ctr = entry.in_use_ctr.saturating_sub(1);
        if entry.in_use_ctr > 0 {
            return UnsubscribeOutcome::Decremented(entry.in_use_ctr);
        }
        // Keep insertion order so replays are deterministic.
        UnsubscribeOutcome::Removed(self.entries.remove(idx))
    }

    pub fn get(&self, msg_id: MsgId) -> Option<&LocalSubscription> {
        self.entries.iter().find(|e| e.msg_id == msg_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LocalSubscription> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_edges_are_reported() {
        let mut table = LocalSubTable::new(4);
        assert_eq!(table.subscribe(0x0900, Qos::default()), SubscribeOutcome::Added);
        assert_eq!(table.subscribe(0x0900, Qos::default()), SubscribeOutcome::Incremented(2));
        assert_eq!(table.unsubscribe(0x0900), UnsubscribeOutcome::Decremented(1));
        assert!(matches!(table.unsubscribe(0x0900), UnsubscribeOutcome::Removed(s) if s.msg_id == 0x0900));
        assert_eq!(table.unsubscribe(0x0900), UnsubscribeOutcome::NotFound);
        assert!(table.is_empty());
    }

    #[test]
    fn event_messages_are_never_mirrored() {
        let mut table = LocalSubTable::new(4);
        assert_eq!(table.subscribe(EVS_EVENT_MSG_MID, Qos::default()), SubscribeOutcome::Ignored);
        assert!(table.is_empty());
    }

    #[test]
    fn full_table_still_counts_known_ids() {
        let mut table = LocalSubTable::new(1);
        table.subscribe(0x0900, Qos::default());
        assert_eq!(table.subscribe(0x0901, Qos::default()), SubscribeOutcome::TableFull);
        assert_eq!(table.subscribe(0x0900, Qos::default()), SubscribeOutcome::Incremented(2));
        assert_eq!(table.len(), 1);
    }
}
