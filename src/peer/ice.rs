use std::collections::VecDeque;
use tracing::{debug, warn};

use crate::peer::connection::PeerConnection;
use crate::peer::types::IceCandidate;

/// A remote candidate that arrived before its remote description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedCandidate {
    pub from: String,
    pub candidate: IceCandidate,
}

/// Outcome of handing a remote candidate to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Applied,
    Queued,
    Failed,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub applied: usize,
    pub failed: usize,
    pub discarded: usize,
}

/// Buffers remote candidates until the remote description is accepted.
#[derive(Debug, Default)]
pub struct CandidateQueue {
    pending: VecDeque<QueuedCandidate>,
    ready: bool,
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, from: &str, candidate: IceCandidate) {
        self.pending.push_back(QueuedCandidate {
            from: from.to_string(),
            candidate,
        });
        debug!(from, pending = self.pending.len(), "Remote description not set yet, queuing candidate");
    }

    /// Apply immediately once drained, otherwise queue.
    pub async fn deliver(
        &mut self,
        pc: Option<&dyn PeerConnection>,
        from: &str,
        candidate: IceCandidate,
    ) -> Delivery {
        match pc {
            Some(pc) if self.ready => match pc.add_ice_candidate(candidate).await {
                Ok(()) => Delivery::Applied,
                Err(err) => {
                    warn!(error = %err, "Failed to add ICE candidate");
                    Delivery::Failed
                }
            },
            _ => {
                self.enqueue(from, candidate);
                Delivery::Queued
            }
        }
    }

    /// Apply every candidate queued by `from`, in arrival order, then clear the
    /// queue and mark it ready. Entries from other senders are discarded.
    ///
    /// Call exactly once, right after the remote description was applied.
    pub async fn drain(&mut self, pc: &dyn PeerConnection, from: &str) -> DrainReport {
        let mut report = DrainReport::default();
        let pending: Vec<QueuedCandidate> = self.pending.drain(..).collect();
        self.ready = true;

        for entry in pending {
            if entry.from != from {
                report.discarded += 1;
                continue;
            }
            match pc.add_ice_candidate(entry.candidate).await {
                Ok(()) => report.applied += 1,
                Err(err) => {
                    warn!(error = %err, "Failed to apply pending candidate");
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Drop everything queued by `from`, e.g. after it hung up before we
    /// ever saw its offer.
    pub fn discard_from(&mut self, from: &str) -> usize {
        let before = self.pending.len();
        self.pending.retain(|entry| entry.from != from);
        before - self.pending.len()
    }

    /// Forget queued candidates and the ready flag.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.ready = false;
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::types::SessionDescription;
    use crate::testing::FakePeer;

    fn cand(n: usize) -> IceCandidate {
        IceCandidate::new(format!("candidate:{n} 1 udp 1 10.0.0.{n} 5000 typ host"))
    }

    #[tokio::test]
    async fn test_queues_until_drained_then_applies_in_order() {
        let pc = FakePeer::new();
        let mut queue = CandidateQueue::new();

        for n in 0..5 {
            let d = queue.deliver(Some(pc.as_dyn()), "bob", cand(n)).await;
            assert_eq!(d, Delivery::Queued);
        }
        assert_eq!(queue.len(), 5);
        assert!(pc.applied_candidates().is_empty());

        pc.set_remote_description(SessionDescription::offer("v=0"))
            .await
            .unwrap();
        let report = queue.drain(&*pc, "bob").await;

        assert_eq!(report.applied, 5);
        assert!(queue.is_empty());
        assert!(queue.is_ready());
        assert_eq!(pc.applied_candidates(), (0..5).map(cand).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_after_drain_candidates_apply_immediately() {
        let pc = FakePeer::new();
        let mut queue = CandidateQueue::new();
        pc.set_remote_description(SessionDescription::offer("v=0"))
            .await
            .unwrap();
        queue.drain(&*pc, "bob").await;

        let d = queue.deliver(Some(pc.as_dyn()), "bob", cand(9)).await;
        assert_eq!(d, Delivery::Applied);
        assert!(queue.is_empty());
        assert_eq!(pc.applied_candidates(), vec![cand(9)]);
    }

    #[tokio::test]
    async fn test_failed_candidate_does_not_abort_drain() {
        let pc = FakePeer::new();
        pc.reject_candidate(&cand(1).candidate);
        let mut queue = CandidateQueue::new();
        for n in 0..3 {
            queue.enqueue("bob", cand(n));
        }
        pc.set_remote_description(SessionDescription::offer("v=0"))
            .await
            .unwrap();

        let report = queue.drain(&*pc, "bob").await;
        assert_eq!(report.applied, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(pc.applied_candidates(), vec![cand(0), cand(2)]);
    }

    #[tokio::test]
    async fn test_drain_discards_other_senders() {
        let pc = FakePeer::new();
        let mut queue = CandidateQueue::new();
        queue.enqueue("mallory", cand(0));
        queue.enqueue("bob", cand(1));
        pc.set_remote_description(SessionDescription::offer("v=0"))
            .await
            .unwrap();

        let report = queue.drain(&*pc, "bob").await;
        assert_eq!(report.discarded, 1);
        assert_eq!(pc.applied_candidates(), vec![cand(1)]);
    }

    #[tokio::test]
    async fn test_without_connection_candidates_queue_even_when_ready() {
        let pc = FakePeer::new();
        let mut queue = CandidateQueue::new();
        queue.drain(&*pc, "bob").await;

        assert_eq!(queue.deliver(None, "bob", cand(0)).await, Delivery::Queued);
    }

    #[test]
    fn test_discard_from_keeps_other_senders() {
        let mut queue = CandidateQueue::new();
        queue.enqueue("bob", cand(0));
        queue.enqueue("carol", cand(1));
        queue.enqueue("bob", cand(2));

        assert_eq!(queue.discard_from("bob"), 2);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_reset_clears_flag_and_entries() {
        let mut queue = CandidateQueue::new();
        queue.enqueue("bob", cand(0));
        queue.reset();
        assert!(queue.is_empty());
        assert!(!queue.is_ready());
    }
}
