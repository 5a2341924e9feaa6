//! Deciding which fires to perform once a timer wakes up.
use chrono::{DateTime, TimeDelta, Utc};

use crate::job::{schedule::Schedule, MisfirePolicy};

/// The fires to perform for a wake up and the fire time to wait for afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirePlan {
    pub fires: Vec<DateTime<Utc>>,
    /// [`None`] when the schedule has no further occurrences.
    pub next: Option<DateTime<Utc>>,
    pub misfired: bool,
}

/// Plan the fires for a timer that was due at `due` and woke up at `now`.
///
/// A wake up no later than `threshold` after `due` is on time and fires `due`. Anything later is
/// a misfire and is resolved with `policy`:
/// - [`MisfirePolicy::FireNow`] fires once, at `now`,
/// - [`MisfirePolicy::Skip`] fires nothing,
/// - [`MisfirePolicy::Ignore`] fires the missed occurrences in order, at most `max_catch_up`.
///
/// After a misfire the next fire is the first occurrence after `now`.
pub fn plan_fires(
    schedule: &Schedule,
    due: DateTime<Utc>,
    now: DateTime<Utc>,
    policy: MisfirePolicy,
    threshold: TimeDelta,
    max_catch_up: usize,
) -> FirePlan {
    if now - due <= threshold {
        return FirePlan {
            fires: vec![due],
            next: schedule.next_after(&due),
            misfired: false,
        };
    }
    let fires = match policy {
        MisfirePolicy::FireNow => vec![now],
        MisfirePolicy::Skip => vec![],
        MisfirePolicy::Ignore => schedule.occurrences_between(&due, &now, max_catch_up),
    };
    FirePlan {
        fires,
        next: schedule.next_after(&now),
        misfired: true,
    }
}

#[cfg(test)]
mod test {
    use chrono::TimeZone;

    use super::*;

    const THRESHOLD: TimeDelta = TimeDelta::seconds(60);

    fn at(hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 1, hour, minute, second).unwrap()
    }

    fn every_minute() -> Schedule {
        Schedule::parse("* * * * *").unwrap()
    }

    #[test]
    fn on_time() {
        for policy in [MisfirePolicy::FireNow, MisfirePolicy::Ignore, MisfirePolicy::Skip] {
            let plan = plan_fires(
                &every_minute(),
                at(10, 0, 0),
                at(10, 0, 0) + TimeDelta::milliseconds(15),
                policy,
                THRESHOLD,
                100,
            );
            assert_eq!(
                plan,
                FirePlan {
                    fires: vec![at(10, 0, 0)],
                    next: Some(at(10, 1, 0)),
                    misfired: false,
                }
            );
        }
    }

    #[test]
    fn late_within_threshold_is_on_time() {
        let plan = plan_fires(
            &every_minute(),
            at(10, 0, 0),
            at(10, 0, 45),
            MisfirePolicy::Skip,
            THRESHOLD,
            100,
        );
        assert_eq!(plan.fires, vec![at(10, 0, 0)]);
        assert_eq!(plan.next, Some(at(10, 1, 0)));
    }

    #[test]
    fn misfire_fire_now() {
        let plan = plan_fires(
            &every_minute(),
            at(10, 0, 0),
            at(10, 30, 30),
            MisfirePolicy::FireNow,
            THRESHOLD,
            100,
        );
        assert_eq!(plan.fires, vec![at(10, 30, 30)]);
        assert_eq!(plan.next, Some(at(10, 31, 0)));
        assert!(plan.misfired);
    }

    #[test]
    fn misfire_skip() {
        let plan = plan_fires(
            &every_minute(),
            at(10, 0, 0),
            at(10, 30, 30),
            MisfirePolicy::Skip,
            THRESHOLD,
            100,
        );
        assert!(plan.fires.is_empty());
        assert_eq!(plan.next, Some(at(10, 31, 0)));
    }

    #[test]
    fn misfire_ignore_fires_missed_in_order() {
        let plan = plan_fires(
            &every_minute(),
            at(10, 0, 0),
            at(10, 3, 30),
            MisfirePolicy::Ignore,
            THRESHOLD,
            100,
        );
        assert_eq!(
            plan.fires,
            vec![at(10, 0, 0), at(10, 1, 0), at(10, 2, 0), at(10, 3, 0)]
        );
        assert_eq!(plan.next, Some(at(10, 4, 0)));
    }

    #[test]
    fn misfire_ignore_is_capped() {
        let plan = plan_fires(
            &every_minute(),
            at(0, 0, 0),
            at(23, 0, 0),
            MisfirePolicy::Ignore,
            THRESHOLD,
            5,
        );
        assert_eq!(plan.fires.len(), 5);
        assert_eq!(plan.fires[0], at(0, 0, 0));
        assert_eq!(plan.fires[4], at(0, 4, 0));
        assert_eq!(plan.next, Some(at(23, 1, 0)));
    }

    #[test]
    fn no_further_occurrences() {
        let once = Schedule::parse("0 0 10 1 2 * 2024").unwrap();
        let plan = plan_fires(
            &once,
            at(10, 0, 0),
            at(10, 0, 1),
            MisfirePolicy::FireNow,
            THRESHOLD,
            100,
        );
        assert_eq!(plan.fires, vec![at(10, 0, 0)]);
        assert_eq!(plan.next, None);
    }
}
