//! Time-to-live handling.
//!
//! Callers express lifetimes as a [`Ttl`]. Before anything reaches a remote
//! store the TTL is resolved against the store's clock into a [`ResolvedTtl`]:
//! either "forever", "already expired" (the write becomes a forget), or a whole
//! number of seconds that is at least one.

use crate::error::{LarderResult, ValidationError};
use crate::Timestamp;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Largest TTL that survives conversion to a signed millisecond offset.
pub const MAX_TTL_SECONDS: u64 = (i64::MAX / 1000) as u64;

/// Caller-facing lifetime of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ttl {
    /// Never expires.
    Forever,
    /// Expires after the given duration.
    Duration(Duration),
    /// Expires at an absolute point in time.
    Until(Timestamp),
}

/// A TTL after rounding against a clock reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolvedTtl {
    Forever,
    /// Zero or negative remaining lifetime.
    Expired,
    /// Whole seconds, always >= 1.
    Seconds(u64),
}

impl Ttl {
    /// TTL of a whole number of seconds.
    pub fn seconds(secs: u64) -> Self {
        Ttl::Duration(Duration::from_secs(secs))
    }

    /// Resolve against `now`.
    ///
    /// Positive lifetimes round up to whole seconds, so a sub-second TTL
    /// becomes one second rather than "never" or "expired".
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidTtl` when the duration cannot be
    /// represented as a signed millisecond offset.
    pub fn resolve(&self, now: Timestamp) -> LarderResult<ResolvedTtl> {
        match self {
            Ttl::Forever => Ok(ResolvedTtl::Forever),
            Ttl::Duration(d) => {
                if d.is_zero() {
                    return Ok(ResolvedTtl::Expired);
                }
                let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
                if secs > MAX_TTL_SECONDS {
                    return Err(ValidationError::InvalidTtl {
                        reason: format!("{} seconds exceeds maximum {}", secs, MAX_TTL_SECONDS),
                    }
                    .into());
                }
                Ok(ResolvedTtl::Seconds(secs))
            }
            Ttl::Until(at) => {
                let remaining_ms = at.signed_duration_since(now).num_milliseconds();
                if remaining_ms <= 0 {
                    Ok(ResolvedTtl::Expired)
                } else {
                    // remaining_ms > 0 so the cast is lossless
                    Ok(ResolvedTtl::Seconds((remaining_ms as u64).div_ceil(1000)))
                }
            }
        }
    }
}

impl Default for Ttl {
    fn default() -> Self {
        Ttl::Forever
    }
}

impl From<Duration> for Ttl {
    fn from(d: Duration) -> Self {
        Ttl::Duration(d)
    }
}

impl From<Option<Duration>> for Ttl {
    fn from(d: Option<Duration>) -> Self {
        d.map_or(Ttl::Forever, Ttl::Duration)
    }
}

impl From<Timestamp> for Ttl {
    fn from(at: Timestamp) -> Self {
        Ttl::Until(at)
    }
}

impl ResolvedTtl {
    /// Seconds remaining, `None` for forever or expired.
    pub fn as_seconds(&self) -> Option<u64> {
        match self {
            ResolvedTtl::Seconds(s) => Some(*s),
            _ => None,
        }
    }

    pub fn is_expired(&self) -> bool {
        matches!(self, ResolvedTtl::Expired)
    }

    /// Expiry to attach to an item. `None` when the TTL already elapsed.
    pub fn to_expiry(&self) -> Option<Expiry> {
        match self {
            ResolvedTtl::Forever => Some(Expiry::Never),
            ResolvedTtl::Expired => None,
            ResolvedTtl::Seconds(s) => Some(Expiry::After(Duration::from_secs(*s))),
        }
    }
}

/// Expiry carried by a cache item.
///
/// Items read back from a store always carry `Never` or `At`. `After` is
/// resolved against the store's own clock when the item is saved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Expiry {
    #[default]
    Never,
    After(Duration),
    At(Timestamp),
}

impl Expiry {
    /// Absolute expiry relative to `now`, `None` meaning never.
    pub fn resolve(&self, now: Timestamp) -> LarderResult<Option<Timestamp>> {
        match self {
            Expiry::Never => Ok(None),
            Expiry::At(at) => Ok(Some(*at)),
            Expiry::After(d) => {
                let offset = chrono::Duration::from_std(*d).map_err(|e| {
                    ValidationError::InvalidTtl {
                        reason: e.to_string(),
                    }
                })?;
                now.checked_add_signed(offset).map(Some).ok_or_else(|| {
                    ValidationError::InvalidTtl {
                        reason: format!("{:?} from {} overflows", d, now),
                    }
                    .into()
                })
            }
        }
    }

    /// Check whether an item with this expiry is dead at `now`.
    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        match self {
            Expiry::At(at) => now >= *at,
            Expiry::Never | Expiry::After(_) => false,
        }
    }
}
