//! Instance leases.
//!
//! A lease gives one worker the exclusive right to advance one instance until
//! it is released or expires. Expiry is what recovers instances from workers
//! that crash mid-step.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A time-bounded claim on an instance by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub instance_id: String,
    /// The worker holding the lease.
    pub owner: String,
    /// Unique per acquisition; release and extend must present it.
    pub token: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// Create a lease expiring `ttl` from now.
    pub fn new(
        instance_id: impl Into<String>,
        owner: impl Into<String>,
        token: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            instance_id: instance_id.into(),
            owner: owner.into(),
            token: token.into(),
            acquired_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_owned_by(&self, owner: &str) -> bool {
        self.owner == owner
    }

    /// Push expiry to `ttl` from now.
    pub fn renewed(&self, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
            ..self.clone()
        }
    }
}
