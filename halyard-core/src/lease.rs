use std::time::Duration;

use tokio::time::Instant;

use crate::types::NodeId;

/// Exclusive, time-bounded write authority granted by a voter majority.
///
/// Leases are compared by epoch: a lease with a higher epoch always
/// supersedes one with a lower epoch, whatever their expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub holder: NodeId,
    pub epoch: u64,
    pub expires_at: Instant,
    pub preferred: bool,
}

impl Lease {
    pub fn new(holder: impl Into<NodeId>, epoch: u64, expires_at: Instant, preferred: bool) -> Self {
        Self {
            holder: holder.into(),
            epoch,
            expires_at,
            preferred,
        }
    }

    pub fn is_valid_at(&self, now: Instant) -> bool {
        now < self.expires_at
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Instant::now())
    }

    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    pub fn is_held_by(&self, node: &str) -> bool {
        self.holder == node && self.is_valid()
    }

    /// The same lease extended to `expires_at`; the epoch is unchanged.
    pub fn renewed(&self, expires_at: Instant) -> Self {
        Self {
            expires_at: expires_at.max(self.expires_at),
            ..self.clone()
        }
    }

    pub fn supersedes(&self, other: &Lease) -> bool {
        self.epoch > other.epoch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lease_expires_after_its_duration() {
        let lease = Lease::new("node_0", 3, Instant::now() + Duration::from_millis(50), false);
        assert!(lease.is_valid());
        assert!(lease.is_held_by("node_0"));
        assert!(!lease.is_held_by("node_1"));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!lease.is_valid());
        assert_eq!(lease.remaining(), Duration::ZERO);
    }

    #[tokio::test]
    async fn renewal_never_shortens_and_keeps_epoch() {
        let now = Instant::now();
        let lease = Lease::new("node_0", 3, now + Duration::from_secs(2), true);
        let shorter = lease.renewed(now + Duration::from_secs(1));
        assert_eq!(shorter.expires_at, lease.expires_at);

        let longer = lease.renewed(now + Duration::from_secs(5));
        assert_eq!(longer.epoch, 3);
        assert!(longer.preferred);
        assert!(Lease::new("node_1", 4, now, false).supersedes(&longer));
    }
}
