use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::time;
use tracing::{error, info};

use crate::state::AppState;

/// Daily expiry sweep. Sleeps until the configured UTC hour, flips every
/// overdue subscription and key, repeats. Lazy expiry on read covers the
/// gap between runs.
pub async fn run(state: Arc<AppState>) {
    info!(
        "expiry sweep scheduled daily at {:02}:00 UTC",
        state.config.sweep_hour
    );
    loop {
        let wait = seconds_until_hour(state.clock.now(), state.config.sweep_hour);
        time::sleep(time::Duration::from_secs(wait)).await;

        match state.subscriptions.sweep_expired().await {
            Ok((subs, keys)) => {
                info!("expiry sweep: {} subscription(s), {} key(s) expired", subs, keys)
            }
            Err(e) => error!("expiry sweep failed: {:#}", e),
        }
    }
}

/// Seconds until the next occurrence of `hour:00:00` UTC, never zero so the
/// loop cannot spin inside the same second.
fn seconds_until_hour(now: DateTime<Utc>, hour: u32) -> u64 {
    let today = now
        .date_naive()
        .and_hms_opt(hour, 0, 0)
        .expect("sweep hour validated at config load")
        .and_utc();
    let next = if today > now {
        today
    } else {
        today + Duration::days(1)
    };
    (next - now).num_seconds().max(1) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn waits_until_the_same_day_when_the_hour_is_ahead() {
        let now = Utc.with_ymd_and_hms(2025, 1, 10, 1, 30, 0).unwrap();
        assert_eq!(seconds_until_hour(now, 3), 90 * 60);
    }

    #[test]
    fn rolls_over_to_tomorrow_when_the_hour_has_passed() {
        let now = Utc.with_ymd_and_hms(2025, 1, 10, 4, 0, 0).unwrap();
        assert_eq!(seconds_until_hour(now, 3), 23 * 3600);
    }

    #[test]
    fn exact_hit_schedules_a_full_day_ahead() {
        let now = Utc.with_ymd_and_hms(2025, 1, 10, 3, 0, 0).unwrap();
        assert_eq!(seconds_until_hour(now, 3), 24 * 3600);
    }
}
