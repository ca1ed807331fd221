//! Ordering key of the global event queue.

use crate::NodeIndex;
use blockmania_core::{Event, EventPriority};
use std::time::Duration;

/// Key of one scheduled event.
///
/// Events are ordered by time, then priority, then node, then insertion
/// sequence. The sequence makes every key unique and keeps ties in FIFO
/// order, so the queue never depends on hash or allocation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventKey {
    pub time: Duration,
    pub priority: EventPriority,
    pub node_index: NodeIndex,
    pub sequence: u64,
}

impl EventKey {
    pub fn new(time: Duration, event: &Event, node_index: NodeIndex, sequence: u64) -> Self {
        Self {
            time,
            priority: event.priority(),
            node_index,
            sequence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_time_then_priority_then_node() {
        let mut queue = BTreeMap::new();
        let later = EventKey::new(Duration::from_millis(5), &Event::CleanupTimer, 0, 1);
        let timer = EventKey::new(Duration::from_millis(1), &Event::ProposalTimer, 1, 2);
        let internal = EventKey::new(
            Duration::from_millis(1),
            &Event::BatchesCommitted { entries: vec![] },
            2,
            3,
        );
        let same_node_first = EventKey::new(Duration::from_millis(1), &Event::ViewChangeTimer, 1, 0);
        queue.insert(later, "later");
        queue.insert(timer, "timer");
        queue.insert(internal, "internal");
        queue.insert(same_node_first, "same node, earlier sequence");

        let order: Vec<&str> = queue.values().copied().collect();
        assert_eq!(
            order,
            vec!["internal", "same node, earlier sequence", "timer", "later"]
        );
    }
}
