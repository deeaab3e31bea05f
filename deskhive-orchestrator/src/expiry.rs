use chrono::{DateTime, Duration, Utc};

use crate::config::Settings;

/// Pure expiry arithmetic: no I/O, no clock reads. Callers supply `now`.
#[derive(Clone, Copy, Debug)]
pub struct ExpiryPolicy {
    /// Days until a fresh resource expires.
    pub expiry_period: i64,
    /// Days added per "extend" press.
    pub extend_period: i64,
    /// Hard lifetime cap in days from creation; negative means no cap.
    pub max_lifetime: i64,
}

impl ExpiryPolicy {
    pub fn initial_expiry(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + Duration::days(self.expiry_period)
    }

    /// How much extra time an "extend" press is allowed to add.
    ///
    /// The default is `extend_period`, clamped so the resource never outlives
    /// `created + max_lifetime`. No current expiry means no extension. An
    /// extension that would move the expiry earlier than its current value is
    /// refused: extending only ever postpones, so a manually-set far-future
    /// expiry cannot be shortened from the extend button.
    pub fn permitted_extension(
        &self,
        created: DateTime<Utc>,
        expires: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Duration {
        let Some(expires) = expires else {
            return Duration::zero();
        };
        let mut new_expires = now + Duration::days(self.extend_period);
        if new_expires <= expires {
            return Duration::zero();
        }
        if self.max_lifetime >= 0 {
            let limit = created + Duration::days(self.max_lifetime);
            new_expires = new_expires.min(limit);
        }
        (new_expires - now).max(Duration::zero())
    }

    /// The expiry after an extend press; unchanged when no extension is
    /// permitted.
    pub fn new_expiry(
        &self,
        created: DateTime<Utc>,
        expires: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let permitted = self.permitted_extension(created, expires, now);
        if permitted > Duration::zero() {
            Some(now + permitted)
        } else {
            expires
        }
    }
}

pub fn instance_policy(settings: &Settings) -> ExpiryPolicy {
    ExpiryPolicy {
        expiry_period: settings.instance_expiry_days,
        extend_period: settings.instance_extension_days,
        max_lifetime: settings.instance_lifetime_days,
    }
}

/// Shelved volumes get archived on schedule; there is no extend button for
/// them, extension goes through unshelving.
pub fn volume_policy(settings: &Settings) -> ExpiryPolicy {
    ExpiryPolicy {
        expiry_period: settings.volume_expiry_days,
        extend_period: 0,
        max_lifetime: -1,
    }
}

pub fn backup_policy(settings: &Settings) -> ExpiryPolicy {
    ExpiryPolicy {
        expiry_period: settings.backup_retention_days,
        extend_period: 0,
        max_lifetime: -1,
    }
}

pub fn boost_policy(settings: &Settings) -> ExpiryPolicy {
    ExpiryPolicy {
        expiry_period: settings.boost_expiry_days,
        extend_period: settings.boost_extension_days,
        max_lifetime: settings.boost_lifetime_days,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(expiry: i64, extend: i64, lifetime: i64) -> ExpiryPolicy {
        ExpiryPolicy {
            expiry_period: expiry,
            extend_period: extend,
            max_lifetime: lifetime,
        }
    }

    #[test]
    fn initial_expiry_adds_the_period() {
        let now = Utc::now();
        assert_eq!(policy(14, 14, -1).initial_expiry(now), now + Duration::days(14));
    }

    #[test]
    fn no_expiry_means_no_extension() {
        let now = Utc::now();
        let p = policy(14, 14, -1);
        assert_eq!(p.permitted_extension(now, None, now), Duration::zero());
        assert_eq!(p.new_expiry(now, None, now), None);
    }

    #[test]
    fn extension_is_clamped_by_lifetime_cap() {
        let now = Utc::now();
        let p = policy(5, 5, 5);
        // Created 3 days ago, expires tomorrow: only 2 more days fit under
        // the 5-day lifetime.
        let created = now - Duration::days(3);
        let expires = Some(now + Duration::days(1));
        assert_eq!(p.permitted_extension(created, expires, now), Duration::days(2));
    }

    #[test]
    fn extension_is_zero_at_the_lifetime_cap_and_never_negative() {
        let now = Utc::now();
        let p = policy(5, 5, 5);
        // Created exactly max_lifetime days ago.
        let created = now - Duration::days(5);
        let expires = Some(now + Duration::days(1));
        assert_eq!(p.permitted_extension(created, expires, now), Duration::zero());
        // Created beyond the cap: still zero, never negative.
        let created = now - Duration::days(9);
        assert_eq!(p.permitted_extension(created, expires, now), Duration::zero());
    }

    #[test]
    fn extension_never_shortens_a_far_future_expiry() {
        let now = Utc::now();
        let p = policy(5, 5, -1);
        // An operator pushed the expiry way out by hand; the extend button
        // must not pull it back to now + 5d.
        let expires = Some(now + Duration::days(42));
        let created = now - Duration::days(1);
        assert_eq!(p.permitted_extension(created, expires, now), Duration::zero());
        assert_eq!(p.new_expiry(created, expires, now), expires);
    }

    #[test]
    fn uncapped_extension_uses_the_full_extend_period() {
        let now = Utc::now();
        let p = policy(5, 7, -1);
        let created = now - Duration::days(100);
        let expires = Some(now + Duration::days(1));
        assert_eq!(p.permitted_extension(created, expires, now), Duration::days(7));
        assert_eq!(p.new_expiry(created, expires, now), Some(now + Duration::days(7)));
    }
}
