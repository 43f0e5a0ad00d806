//! Account state machine
//!
//! Legal transitions between account statuses. The repository applies the
//! resulting status; this module only decides what is allowed and whether
//! the transition warrants a webhook notification.
//!
//! ```text
//! any         -> active       admin reset, or rate-limit clear once resetAt passed
//! active      -> rateLimited  upstream 429 / usage_limit_reached
//! active      -> unauthorized upstream 401 or 402
//! active      -> paused       admin toggles schedulable off
//! paused      -> active       admin toggles schedulable on
//! rateLimited -> active       lazy recovery on next use when resetAt passed
//! ```

use chrono::{DateTime, Utc};

use super::record::AccountStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    AdminReset,
    RateLimitClear,
    UpstreamRateLimit,
    UpstreamUnauthorized,
    SchedulableOff,
    SchedulableOn,
}

/// Evaluate a trigger against the current status. Returns the new status,
/// or `None` when the transition is not legal and must be ignored.
pub fn next_status(
    current: AccountStatus,
    trigger: Trigger,
    now: DateTime<Utc>,
    rate_limit_reset_at: Option<DateTime<Utc>>,
) -> Option<AccountStatus> {
    match trigger {
        Trigger::AdminReset => Some(AccountStatus::Active),
        Trigger::RateLimitClear => match current {
            AccountStatus::RateLimited => {
                let due = rate_limit_reset_at.map(|reset| now >= reset).unwrap_or(true);
                if due {
                    Some(AccountStatus::Active)
                } else {
                    None
                }
            }
            // Clearing an already-active account is a no-op, not an error.
            AccountStatus::Active => None,
            _ => None,
        },
        Trigger::UpstreamRateLimit => match current {
            AccountStatus::Active | AccountStatus::Created => Some(AccountStatus::RateLimited),
            AccountStatus::RateLimited => Some(AccountStatus::RateLimited),
            _ => None,
        },
        Trigger::UpstreamUnauthorized => match current {
            AccountStatus::Active | AccountStatus::Created | AccountStatus::RateLimited => {
                Some(AccountStatus::Unauthorized)
            }
            AccountStatus::Unauthorized => Some(AccountStatus::Unauthorized),
            _ => None,
        },
        Trigger::SchedulableOff => match current {
            AccountStatus::Active => Some(AccountStatus::Paused),
            _ => None,
        },
        Trigger::SchedulableOn => match current {
            AccountStatus::Paused => Some(AccountStatus::Active),
            _ => None,
        },
    }
}

/// Webhook error code for a transition, if it should be announced.
/// Announced: entry to unauthorized, manual pause, and recovery to active
/// from any non-active status.
pub fn webhook_code(prev: AccountStatus, next: AccountStatus) -> Option<&'static str> {
    match (prev, next) {
        (p, AccountStatus::Unauthorized) if p != AccountStatus::Unauthorized => {
            Some("ACCOUNT_UNAUTHORIZED")
        }
        (AccountStatus::Active, AccountStatus::Paused) => Some("ACCOUNT_PAUSED"),
        (p, AccountStatus::Active) if p != AccountStatus::Active => Some("ACCOUNT_RECOVERED"),
        _ => None,
    }
}

/// The schedulable flag must be false in every status except active.
pub fn schedulable_after(next: AccountStatus, requested: bool) -> bool {
    matches!(next, AccountStatus::Active) && requested
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn rate_limit_clear_requires_reset_passed() {
        let now = Utc::now();
        let future = Some(now + Duration::minutes(10));
        let past = Some(now - Duration::minutes(10));
        assert_eq!(
            next_status(AccountStatus::RateLimited, Trigger::RateLimitClear, now, past),
            Some(AccountStatus::Active)
        );
        assert_eq!(
            next_status(AccountStatus::RateLimited, Trigger::RateLimitClear, now, future),
            None
        );
    }

    #[test]
    fn clear_on_active_is_noop() {
        let now = Utc::now();
        assert_eq!(
            next_status(AccountStatus::Active, Trigger::RateLimitClear, now, None),
            None
        );
    }

    #[test]
    fn pause_only_from_active() {
        let now = Utc::now();
        assert_eq!(
            next_status(AccountStatus::Active, Trigger::SchedulableOff, now, None),
            Some(AccountStatus::Paused)
        );
        assert_eq!(
            next_status(AccountStatus::RateLimited, Trigger::SchedulableOff, now, None),
            None
        );
        assert_eq!(
            next_status(AccountStatus::Paused, Trigger::SchedulableOn, now, None),
            Some(AccountStatus::Active)
        );
    }

    #[test]
    fn admin_reset_always_recovers() {
        let now = Utc::now();
        for status in [
            AccountStatus::RateLimited,
            AccountStatus::Unauthorized,
            AccountStatus::Error,
            AccountStatus::Paused,
            AccountStatus::Created,
        ] {
            assert_eq!(
                next_status(status, Trigger::AdminReset, now, None),
                Some(AccountStatus::Active)
            );
        }
    }

    #[test]
    fn webhook_codes() {
        assert_eq!(
            webhook_code(AccountStatus::Active, AccountStatus::Unauthorized),
            Some("ACCOUNT_UNAUTHORIZED")
        );
        assert_eq!(
            webhook_code(AccountStatus::Active, AccountStatus::Paused),
            Some("ACCOUNT_PAUSED")
        );
        assert_eq!(
            webhook_code(AccountStatus::RateLimited, AccountStatus::Active),
            Some("ACCOUNT_RECOVERED")
        );
        assert_eq!(webhook_code(AccountStatus::Active, AccountStatus::Active), None);
        assert_eq!(
            webhook_code(AccountStatus::Active, AccountStatus::RateLimited),
            None
        );
    }

    #[test]
    fn schedulable_forced_false_outside_active() {
        assert!(schedulable_after(AccountStatus::Active, true));
        assert!(!schedulable_after(AccountStatus::Active, false));
        assert!(!schedulable_after(AccountStatus::RateLimited, true));
        assert!(!schedulable_after(AccountStatus::Unauthorized, true));
        assert!(!schedulable_after(AccountStatus::Paused, true));
    }
}
