//! Lease values and skew-bounded validity.
//!
//! A lease is only meaningful relative to the loosely synchronized global
//! clock, whose error is bounded by the configured `d_max`. The validity
//! predicates here are therefore three-valued: a lease is provably expired,
//! provably valid, or inside the grace period where neither can be shown.

use serde::{Deserialize, Serialize};

use crate::types::{MasterEpoch, NodeId, Timestamp};

/// Immutable snapshot of a negotiated lease: holder, expiry, master epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Current holder, `None` when no lease is known.
    pub holder: Option<NodeId>,
    /// Expiry on the global clock, in milliseconds.
    pub expires_at: Timestamp,
    /// Master epoch negotiated together with the lease.
    pub master_epoch: MasterEpoch,
}

impl Lease {
    /// The "no lease known" value.
    pub fn empty() -> Self {
        Self {
            holder: None,
            expires_at: 0,
            master_epoch: MasterEpoch::Unrequested,
        }
    }

    /// Create a lease with a known holder and expiry.
    pub fn new(holder: NodeId, expires_at: Timestamp, master_epoch: MasterEpoch) -> Self {
        Self {
            holder: Some(holder),
            expires_at,
            master_epoch,
        }
    }

    /// True if this is the empty lease.
    pub fn is_empty(&self) -> bool {
        self.holder.is_none()
    }

    /// The lease is provably expired even if our clock runs `d_max` behind.
    pub fn has_timed_out(&self, now: Timestamp, d_max: u64) -> bool {
        self.expires_at + d_max < now
    }

    /// The lease is provably still valid even if our clock runs `d_max`
    /// ahead.
    pub fn is_valid(&self, now: Timestamp, d_max: u64) -> bool {
        self.expires_at > now + d_max
    }

    /// Neither provably expired nor provably valid under the skew bound.
    pub fn in_grace_period(&self, now: Timestamp, d_max: u64) -> bool {
        !self.has_timed_out(now, d_max) && !self.is_valid(now, d_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const D_MAX: u64 = 500;

    fn lease_expiring_at(t: Timestamp) -> Lease {
        Lease::new(NodeId::from("node-a"), t, MasterEpoch::Unrequested)
    }

    #[test]
    fn test_empty_lease() {
        let l = Lease::empty();
        assert!(l.is_empty());
        assert_eq!(l.expires_at, 0);
        assert_eq!(l.master_epoch, MasterEpoch::Unrequested);
    }

    #[test]
    fn test_lease_provably_expired() {
        let l = lease_expiring_at(10_000);
        assert!(l.has_timed_out(10_501, D_MAX));
        assert!(!l.is_valid(10_501, D_MAX));
    }

    #[test]
    fn test_lease_provably_valid() {
        let l = lease_expiring_at(10_000);
        assert!(l.is_valid(9_499, D_MAX));
        assert!(!l.has_timed_out(9_499, D_MAX));
    }

    #[test]
    fn test_lease_grace_period_straddles_expiry() {
        let l = lease_expiring_at(10_000);
        // Anywhere in [expiry - d_max, expiry + d_max] is ambiguous.
        for now in [9_500, 10_000, 10_500] {
            assert!(l.in_grace_period(now, D_MAX), "now = {now}");
            assert!(!l.has_timed_out(now, D_MAX), "now = {now}");
            assert!(!l.is_valid(now, D_MAX), "now = {now}");
        }
    }

    #[test]
    fn test_validity_states_are_disjoint() {
        let l = lease_expiring_at(10_000);
        for now in (9_000..12_000).step_by(100) {
            let states = [
                l.has_timed_out(now, D_MAX),
                l.is_valid(now, D_MAX),
                l.in_grace_period(now, D_MAX),
            ];
            assert_eq!(
                states.iter().filter(|s| **s).count(),
                1,
                "exactly one validity state at now = {now}"
            );
        }
    }
}
