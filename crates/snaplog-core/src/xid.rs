//! Circular 32-bit transaction identifiers
//!
//! Master transaction ids are a 32-bit counter that wraps. Two normal ids are
//! ordered by the signed distance between them, so every id has 2^31 - 1 ids
//! after it and 2^31 before it. The three reserved ids sort before every
//! normal id and compare among themselves by magnitude.
//!
//! ```text
//!            FIRST_NORMAL (3)
//!                 │   forward half-circle
//!   MAX_NORMAL ───┼──────────────►  x + 2^31 - 1  (last_normal)
//!                 │
//!          reserved: 0 1 2
//! ```
//!
//! Raw magnitudes must never be compared directly outside this module.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Distance to the far edge of the forward half-circle
const HALF_CIRCLE: u32 = 1 << 31;

/// A master transaction identifier with wraparound-aware ordering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(u32);

impl TransactionId {
    /// Never assigned to a transaction
    pub const INVALID: Self = Self(0);
    /// Bootstrap-time transactions
    pub const BOOTSTRAP: Self = Self(1);
    /// Frozen rows, older than every normal transaction
    pub const FROZEN: Self = Self(2);
    /// First id handed out to regular transactions
    pub const FIRST_NORMAL: Self = Self(3);
    /// Last id before the counter wraps
    pub const MAX_NORMAL: Self = Self(u32::MAX);

    /// Create an id from a raw counter value
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Raw counter value
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Value as stored in a signed 64-bit column
    pub const fn as_i64(self) -> i64 {
        self.0 as i64
    }

    /// True unless this is one of the reserved ids
    pub const fn is_normal(self) -> bool {
        self.0 >= Self::FIRST_NORMAL.0
    }

    /// `self` is strictly before `other` on the circle
    pub fn precedes(self, other: Self) -> bool {
        if !self.is_normal() || !other.is_normal() {
            return self.0 < other.0;
        }
        let delta = other.0.wrapping_sub(self.0) as i32;
        delta > 0
    }

    /// `self` is before or equal to `other`
    pub fn precedes_or_equals(self, other: Self) -> bool {
        self == other || self.precedes(other)
    }

    /// `self` is strictly after `other`
    pub fn follows(self, other: Self) -> bool {
        self != other && !self.precedes(other)
    }

    /// `self` is after or equal to `other`
    pub fn follows_or_equals(self, other: Self) -> bool {
        !self.precedes(other)
    }

    /// Circular comparison. `Less` means `self` precedes `other`.
    ///
    /// Two ids exactly 2^31 apart both report `Greater`: neither lies in the
    /// other's forward half-circle.
    pub fn compare(self, other: Self) -> Ordering {
        if self == other {
            Ordering::Equal
        } else if self.precedes(other) {
            Ordering::Less
        } else {
            Ordering::Greater
        }
    }

    /// Smallest normal id strictly after this one
    pub fn next_normal(self) -> Self {
        let next = self.0.wrapping_add(1);
        if next < Self::FIRST_NORMAL.0 {
            Self::FIRST_NORMAL
        } else {
            Self(next)
        }
    }

    /// Furthest normal id still inside the forward half-circle.
    ///
    /// Bounds how far ahead of this id a search may look before ids start
    /// comparing as "before" again.
    pub fn last_normal(self) -> Self {
        let last = self.0.wrapping_add(HALF_CIRCLE - 1);
        if last < Self::FIRST_NORMAL.0 {
            Self::MAX_NORMAL
        } else {
            Self(last)
        }
    }
}

impl From<u32> for TransactionId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl TryFrom<i64> for TransactionId {
    type Error = Error;

    fn try_from(value: i64) -> Result<Self> {
        u32::try_from(value)
            .map(Self)
            .map_err(|_| Error::InvalidTransactionId(value))
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn xid(v: u32) -> TransactionId {
        TransactionId::new(v)
    }

    #[test]
    fn test_simple_ordering() {
        assert!(xid(100).precedes(xid(101)));
        assert!(xid(101).follows(xid(100)));
        assert_eq!(xid(5).compare(xid(5)), Ordering::Equal);
        assert_eq!(xid(5).compare(xid(6)), Ordering::Less);
        assert_eq!(xid(6).compare(xid(5)), Ordering::Greater);
    }

    #[test]
    fn test_wraparound_ordering() {
        // MAX_NORMAL is followed by the normal ids after the wrap.
        assert!(TransactionId::MAX_NORMAL.precedes(xid(3)));
        assert!(TransactionId::MAX_NORMAL.precedes(xid(1000)));
        assert!(xid(10).follows(xid(u32::MAX - 10)));
        assert!(!xid(10).precedes(xid(u32::MAX - 10)));
    }

    #[test]
    fn test_reserved_ids_precede_normal_ids() {
        for reserved in [
            TransactionId::INVALID,
            TransactionId::BOOTSTRAP,
            TransactionId::FROZEN,
        ] {
            assert!(!reserved.is_normal());
            assert!(reserved.precedes(TransactionId::FIRST_NORMAL));
            assert!(reserved.precedes(TransactionId::MAX_NORMAL));
            assert!(reserved.precedes(xid(1 << 31)));
            assert!(TransactionId::MAX_NORMAL.follows(reserved));
        }
        assert!(TransactionId::INVALID.precedes(TransactionId::FROZEN));
    }

    #[test]
    fn test_antipodal_ids_both_compare_greater() {
        let a = xid(10);
        let b = xid(10 + (1 << 31));
        assert_eq!(a.compare(b), Ordering::Greater);
        assert_eq!(b.compare(a), Ordering::Greater);
    }

    #[test]
    fn test_half_circle_edge() {
        let a = xid(10);
        let edge = xid(10 + (1 << 31) - 1);
        assert!(a.precedes(edge));
        assert!(edge.follows(a));
    }

    #[test]
    fn test_next_normal_skips_reserved() {
        assert_eq!(xid(100).next_normal(), xid(101));
        assert_eq!(TransactionId::MAX_NORMAL.next_normal(), TransactionId::FIRST_NORMAL);
        assert_eq!(TransactionId::INVALID.next_normal(), TransactionId::FIRST_NORMAL);
        assert_eq!(TransactionId::BOOTSTRAP.next_normal(), TransactionId::FIRST_NORMAL);
        assert_eq!(TransactionId::FROZEN.next_normal(), TransactionId::FIRST_NORMAL);
    }

    #[test]
    fn test_last_normal() {
        assert_eq!(xid(3).last_normal(), xid(3 + (1 << 31) - 1));
        // (2^31 + 1) + (2^31 - 1) wraps to 0, clamped back to MAX_NORMAL.
        assert_eq!(xid((1 << 31) + 1).last_normal(), TransactionId::MAX_NORMAL);
        assert_eq!(xid((1 << 31) + 2).last_normal(), TransactionId::MAX_NORMAL);
        assert_eq!(xid((1 << 31) + 4).last_normal(), xid(3));
    }

    #[test]
    fn test_reserved_never_returned_near_wraparound() {
        let lows = 0u32..64;
        let highs = (u32::MAX - 64)..=u32::MAX;
        let mids = ((1u32 << 31) - 64)..((1u32 << 31) + 64);
        for v in lows.chain(highs).chain(mids) {
            let id = xid(v);
            assert!(id.next_normal().is_normal(), "next_normal({v})");
            assert!(id.last_normal().is_normal(), "last_normal({v})");
            if id.is_normal() {
                assert!(id.precedes(id.next_normal()), "{v} < next_normal");
                assert!(id.precedes(id.last_normal()), "{v} < last_normal");
            }
        }
    }

    #[test]
    fn test_compare_inverse_near_wraparound() {
        let window: Vec<u32> = (3u32..40).chain((u32::MAX - 40)..=u32::MAX).collect();
        for &a in &window {
            for &b in &window {
                let (a, b) = (xid(a), xid(b));
                assert_eq!(a.compare(b), b.compare(a).reverse(), "{a} vs {b}");
            }
        }
    }

    #[test]
    fn test_try_from_i64() {
        assert_eq!(TransactionId::try_from(42i64).unwrap(), xid(42));
        assert_eq!(
            TransactionId::try_from(u32::MAX as i64).unwrap(),
            TransactionId::MAX_NORMAL
        );
        assert!(matches!(
            TransactionId::try_from(-1i64),
            Err(Error::InvalidTransactionId(-1))
        ));
        assert!(TransactionId::try_from(1i64 << 32).is_err());
    }

    proptest! {
        #[test]
        fn prop_compare_is_inverse(a in 3u32.., d in 1u32..(1u32 << 31)) {
            let b = a.wrapping_add(d);
            prop_assume!(b >= 3);
            let (a, b) = (xid(a), xid(b));
            prop_assert_eq!(a.compare(b), Ordering::Less);
            prop_assert_eq!(b.compare(a), Ordering::Greater);
        }

        #[test]
        fn prop_transitive_within_half_circle(
            a in 3u32..,
            d1 in 1u32..(1u32 << 30),
            d2 in 1u32..(1u32 << 30),
        ) {
            let b = a.wrapping_add(d1);
            let c = b.wrapping_add(d2);
            prop_assume!(b >= 3 && c >= 3);
            let (a, b, c) = (xid(a), xid(b), xid(c));
            prop_assert!(a.precedes(b));
            prop_assert!(b.precedes(c));
            prop_assert!(a.precedes(c));
        }

        #[test]
        fn prop_boundaries_are_normal(v in any::<u32>()) {
            let id = xid(v);
            prop_assert!(id.next_normal().is_normal());
            prop_assert!(id.last_normal().is_normal());
        }
    }
}
