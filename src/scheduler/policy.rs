use std::time::Duration;

use derive_more::Display;
use time::PrimitiveDateTime;

/// Why a backup did not transfer anything this time.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum SkipReason {
    #[display("no interval configured, runs only when started manually")]
    ManualOnly,
    #[display("the view of {timestamp} was already backed up")]
    AlreadyBackedUp { timestamp: PrimitiveDateTime },
    #[display("last backup is only {age_minutes} minutes old (interval {interval_minutes})")]
    TooRecent {
        age_minutes: i64,
        interval_minutes: u64,
    },
    #[display("skipped by the operator")]
    OperatorSkipped,
    #[display("nothing to transfer")]
    NothingToTransfer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Run,
    Skip(SkipReason),
}

/// Whether a backup runs, given its interval and the age of the last run relative to the
/// freshest source view. Forced runs ignore the interval but never back up the same view twice.
pub fn decide(
    interval: Option<Duration>,
    force: bool,
    last_backup: Option<PrimitiveDateTime>,
    latest_view: PrimitiveDateTime,
) -> Verdict {
    let Some(interval) = interval.or(force.then_some(Duration::ZERO)) else {
        return Verdict::Skip(SkipReason::ManualOnly);
    };
    let Some(last_backup) = last_backup else {
        return Verdict::Run;
    };

    let age = latest_view - last_backup;
    if age.is_zero() {
        return Verdict::Skip(SkipReason::AlreadyBackedUp {
            timestamp: latest_view,
        });
    }
    if !force && age.whole_seconds() < interval.as_secs() as i64 {
        return Verdict::Skip(SkipReason::TooRecent {
            age_minutes: age.whole_minutes(),
            interval_minutes: interval.as_secs() / 60,
        });
    }
    Verdict::Run
}
