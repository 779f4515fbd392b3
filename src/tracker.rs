use std::collections::HashSet;

use libp2p::PeerId;
use tokio::sync::Mutex;

/// Peers already handled for manager discovery. Grows monotonically.
#[derive(Debug, Default)]
pub struct ProbeTracker {
    seen: Mutex<HashSet<PeerId>>,
}

impl ProbeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check-and-insert in one step. Returns `true` only the first time `peer` is offered.
    pub async fn mark_seen(&self, peer: &PeerId) -> bool {
        self.seen.lock().await.insert(*peer)
    }

    pub async fn contains(&self, peer: &PeerId) -> bool {
        self.seen.lock().await.contains(peer)
    }

    pub async fn len(&self) -> usize {
        self.seen.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_mark_seen_once() {
        let tracker = ProbeTracker::new();
        let peer = PeerId::random();

        assert!(tracker.mark_seen(&peer).await);
        assert!(!tracker.mark_seen(&peer).await);
        assert!(tracker.contains(&peer).await);
        assert_eq!(tracker.len().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_marks_admit_one() {
        let tracker = Arc::new(ProbeTracker::new());
        let peer = PeerId::random();

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let tracker = tracker.clone();
                tokio::spawn(async move { tracker.mark_seen(&peer).await })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
    }
}
