use std::str::FromStr;
use std::time::Duration;

use crate::notify::Channel;
use crate::retry::RetryPolicy;

/// Engine tunables. Defaults match the documented resolution policy; every
/// field can be overridden from `SLOTWISE_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Minimum confidence a suggestion needs to be executed without a human.
    pub auto_execute_threshold: f64,
    /// Lower bound on skill-matched alternative staff confidence.
    pub skill_match_floor: f64,
    /// Failed auto-resolution attempts tolerated before the next call escalates.
    pub max_failed_attempts: u32,
    /// Reach of RESCHEDULE_NEARBY either side of the original start.
    pub reschedule_window_minutes: u32,
    /// Alternative slots captured on each conflict record.
    pub alternatives_snapshot_len: usize,
    pub waitlist_expiry_days: u32,
    pub default_granularity_minutes: u32,
    /// Channel for customer-facing notifications.
    pub customer_channel: Channel,
    pub read_retry: RetryPolicy,
    pub write_retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            auto_execute_threshold: 0.7,
            skill_match_floor: 0.5,
            max_failed_attempts: 2,
            reschedule_window_minutes: 120,
            alternatives_snapshot_len: 5,
            waitlist_expiry_days: 7,
            default_granularity_minutes: 30,
            customer_channel: Channel::Email,
            read_retry: RetryPolicy::exponential(
                3,
                Duration::from_millis(25),
                Duration::from_millis(500),
            ),
            write_retry: RetryPolicy::none(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset or unparsable keys keep their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let get = |key: &str| lookup(key);

        let read_attempts: u32 = parse_or(get("SLOTWISE_READ_RETRY_ATTEMPTS"), defaults.read_retry.max_attempts);
        let read_base_ms: u64 = parse_or(get("SLOTWISE_READ_RETRY_BASE_MS"), 25);

        let customer_channel = match get("SLOTWISE_CUSTOMER_CHANNEL").as_deref() {
            Some("sms") => Channel::Sms,
            Some("push") => Channel::Push,
            Some("internal") => Channel::Internal,
            Some("email") => Channel::Email,
            _ => defaults.customer_channel,
        };

        Self {
            auto_execute_threshold: parse_or(
                get("SLOTWISE_AUTO_EXECUTE_THRESHOLD"),
                defaults.auto_execute_threshold,
            )
            .clamp(0.0, 1.0),
            skill_match_floor: parse_or(get("SLOTWISE_SKILL_MATCH_FLOOR"), defaults.skill_match_floor)
                .clamp(0.0, 1.0),
            max_failed_attempts: parse_or(get("SLOTWISE_MAX_FAILED_ATTEMPTS"), defaults.max_failed_attempts),
            reschedule_window_minutes: parse_or(
                get("SLOTWISE_RESCHEDULE_WINDOW_MINUTES"),
                defaults.reschedule_window_minutes,
            ),
            alternatives_snapshot_len: parse_or(
                get("SLOTWISE_ALTERNATIVES_SNAPSHOT_LEN"),
                defaults.alternatives_snapshot_len,
            ),
            waitlist_expiry_days: parse_or(get("SLOTWISE_WAITLIST_EXPIRY_DAYS"), defaults.waitlist_expiry_days),
            default_granularity_minutes: parse_or(
                get("SLOTWISE_GRANULARITY_MINUTES"),
                defaults.default_granularity_minutes,
            ),
            customer_channel,
            read_retry: RetryPolicy::exponential(
                read_attempts,
                Duration::from_millis(read_base_ms),
                Duration::from_millis(read_base_ms.saturating_mul(20)),
            ),
            write_retry: defaults.write_retry,
        }
    }
}

fn parse_or<T: FromStr>(raw: Option<String>, default: T) -> T {
    raw.and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}
