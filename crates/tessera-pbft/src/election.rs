//! Current view and round-robin primary election.
//!
//! The view is a single atomic, so readers never block on an election in
//! flight and always observe either the pre- or post-election view.

use std::sync::atomic::{AtomicU64, Ordering};

use tessera_types::{ReplicaId, ViewNumber};

use crate::{Error, Result};

#[derive(Debug)]
pub struct PrimaryElection {
    current_view: AtomicU64,
    total_replicas: u32,
}

impl PrimaryElection {
    pub fn new(total_replicas: u32) -> Result<Self> {
        if total_replicas == 0 {
            return Err(Error::invalid("election needs at least one replica"));
        }
        Ok(Self {
            current_view: AtomicU64::new(ViewNumber::ZERO.as_u64()),
            total_replicas,
        })
    }

    pub fn total_replicas(&self) -> u32 {
        self.total_replicas
    }

    pub fn current_view(&self) -> ViewNumber {
        ViewNumber::new(self.current_view.load(Ordering::Acquire))
    }

    /// Advances to `(current + 1) mod total_replicas` and returns the new view.
    pub fn elect_next(&self, total_replicas: u32) -> Result<ViewNumber> {
        if total_replicas == 0 {
            return Err(Error::invalid("cannot elect among zero replicas"));
        }
        let modulus = u64::from(total_replicas);
        let previous = self
            .current_view
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |view| {
                Some((view + 1) % modulus)
            })
            .unwrap_or_else(|view| view);
        let elected = ViewNumber::new((previous + 1) % modulus);
        tracing::info!(
            from = previous,
            view = %elected,
            primary = %elected.primary(total_replicas),
            "elected next view"
        );
        Ok(elected)
    }

    /// Adopts `view`, typically after a view-change quorum.
    pub fn update_view(&self, view: ViewNumber) {
        let previous = self.current_view.swap(view.as_u64(), Ordering::AcqRel);
        if previous != view.as_u64() {
            tracing::info!(from = previous, view = %view, "view updated");
        }
    }

    /// The primary of the current view.
    pub fn primary(&self) -> ReplicaId {
        self.current_view().primary(self.total_replicas)
    }

    pub fn is_primary(&self, replica: ReplicaId) -> bool {
        self.primary() == replica
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    #[test]
    fn starts_in_view_zero_with_replica_zero_primary() {
        let election = PrimaryElection::new(4).unwrap();
        assert_eq!(election.current_view(), ViewNumber::ZERO);
        assert!(election.is_primary(ReplicaId::new(0)));
        assert!(!election.is_primary(ReplicaId::new(1)));
    }

    #[test]
    fn elect_next_wraps_around() {
        let election = PrimaryElection::new(4).unwrap();
        let views: Vec<u64> = (0..5)
            .map(|_| election.elect_next(4).unwrap().as_u64())
            .collect();
        assert_eq!(views, vec![1, 2, 3, 0, 1]);
        assert_eq!(election.primary(), ReplicaId::new(1));
    }

    #[test]
    fn zero_replicas_rejected() {
        assert!(PrimaryElection::new(0).is_err());
        let election = PrimaryElection::new(4).unwrap();
        assert!(matches!(election.elect_next(0), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn update_view_changes_primary() {
        let election = PrimaryElection::new(4).unwrap();
        election.update_view(ViewNumber::new(6));
        assert_eq!(election.current_view(), ViewNumber::new(6));
        assert_eq!(election.primary(), ReplicaId::new(2));
    }

    #[test]
    fn concurrent_elections_are_not_lost() {
        let election = Arc::new(PrimaryElection::new(1000).unwrap());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let election = election.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        election.elect_next(1000).unwrap();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(election.current_view(), ViewNumber::new(400));
    }

    proptest! {
        #[test]
        fn prop_k_elections_advance_k_views(n in 1u32..50, start in 0u64..50, k in 0usize..100) {
            let election = PrimaryElection::new(n).unwrap();
            election.update_view(ViewNumber::new(start));
            for _ in 0..k {
                election.elect_next(n).unwrap();
            }
            let expected = if k == 0 { start } else { (start + k as u64) % u64::from(n) };
            prop_assert_eq!(election.current_view().as_u64(), expected);
        }
    }
}
