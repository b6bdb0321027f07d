use crate::backup_error::BackupError;
use crate::pool::Snapshot;
use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};

/// Per-bucket capacities of the time-to-live policy, parsed from a spec
/// like `30d,4w,12m,1y`. Unnamed buckets hold nothing; the mandatory
/// bucket always has room for the increment chain.
#[derive(Debug, PartialEq, Clone)]
pub struct TtlPolicy {
    pub hourly: usize,
    pub daily: usize,
    pub weekly: usize,
    pub monthly: usize,
    pub yearly: usize,
    pub mandatory: usize,
}

impl TtlPolicy {
    pub fn parse(spec: &str) -> Result<Self, BackupError> {
        let mut policy = TtlPolicy {
            hourly: 0,
            daily: 0,
            weekly: 0,
            monthly: 0,
            yearly: 0,
            mandatory: 100,
        };

        for token in spec
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|token| !token.is_empty())
        {
            let digits: String = token
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect();
            let count = digits.parse::<usize>().map_err(|_| {
                BackupError::Config(format!("invalid retention bucket count: {}", token))
            })?;

            match &token[digits.len()..] {
                "h" => policy.hourly = count,
                "d" => policy.daily = count,
                "w" => policy.weekly = count,
                "m" => policy.monthly = count,
                "y" => policy.yearly = count,
                other => {
                    return Err(BackupError::Config(format!(
                        "unknown retention bucket \"{}\"",
                        other
                    )))
                }
            }
        }

        Ok(policy)
    }
}

/// Assignment of a volume's snapshots to retention buckets. Every
/// timestamped snapshot lands in exactly one bucket or in `trash`.
#[derive(Debug, PartialEq, Default)]
pub struct BucketPlan {
    pub mandatory: Vec<String>,
    pub hourly: Vec<String>,
    pub daily: Vec<String>,
    pub weekly: Vec<String>,
    pub monthly: Vec<String>,
    pub yearly: Vec<String>,
    pub trash: Vec<String>,
}

/// Assigns snapshots to buckets and truncates each bucket to its capacity.
///
/// * `snapshots` - a volume's snapshots sorted newest first; positions 0
///   and 1 are the increment chain and always mandatory
/// * `policy` - bucket capacities
///
pub fn plan(snapshots: &[Snapshot], policy: &TtlPolicy) -> BucketPlan {
    let mut mandatory: Vec<String> = Vec::new();
    let mut hourly: Vec<(NaiveDateTime, String)> = Vec::new();
    let mut daily: Vec<(NaiveDateTime, String)> = Vec::new();
    let mut weekly: Vec<(NaiveDateTime, String)> = Vec::new();
    let mut monthly: Vec<(NaiveDateTime, String)> = Vec::new();
    let mut yearly: Vec<(NaiveDateTime, String)> = Vec::new();
    let mut trash: Vec<String> = Vec::new();

    for (position, snapshot) in snapshots.iter().enumerate() {
        if position < 2 {
            mandatory.push(snapshot.name().to_string());
            continue;
        }

        // snapshots without a parseable timestamp are not ours to prune
        let Some(creation) = snapshot.creation() else {
            continue;
        };
        let entry = (creation, snapshot.name().to_string());

        // not the same hour, within the day of the bucket's first entry
        if match hourly.last() {
            None => true,
            Some((last, _)) => {
                creation < truncate_hour(*last)
                    && hourly
                        .first()
                        .is_some_and(|(first, _)| creation >= truncate_day(*first))
            }
        } {
            hourly.push(entry);
            continue;
        }

        if admit(&daily, &hourly, creation, truncate_day, Some(Duration::days(31))) {
            daily.push(entry);
            continue;
        }

        if admit(&weekly, &daily, creation, truncate_week, Some(Duration::weeks(52))) {
            weekly.push(entry);
            continue;
        }

        if admit(&monthly, &weekly, creation, truncate_month, Some(Duration::days(365))) {
            monthly.push(entry);
            continue;
        }

        if admit(&yearly, &monthly, creation, truncate_year, None) {
            yearly.push(entry);
            continue;
        }

        trash.push(snapshot.name().to_string());
    }

    BucketPlan {
        mandatory: capped(mandatory, policy.mandatory, &mut trash),
        hourly: capped(names(hourly), policy.hourly, &mut trash),
        daily: capped(names(daily), policy.daily, &mut trash),
        weekly: capped(names(weekly), policy.weekly, &mut trash),
        monthly: capped(names(monthly), policy.monthly, &mut trash),
        yearly: capped(names(yearly), policy.yearly, &mut trash),
        trash,
    }
}

/// A snapshot enters a bucket either as its first entry, falling at or
/// before the previous bucket's first entry truncated to the period
/// boundary, or below the bucket's last entry's period and within the
/// bucket's lookback window.
fn admit(
    bucket: &[(NaiveDateTime, String)],
    previous: &[(NaiveDateTime, String)],
    creation: NaiveDateTime,
    truncate: fn(NaiveDateTime) -> NaiveDateTime,
    window: Option<Duration>,
) -> bool {
    match bucket.last() {
        None => previous
            .first()
            .is_some_and(|(first, _)| creation <= truncate(*first)),
        Some((last, _)) => {
            creation < truncate(*last)
                && window.is_none_or(|window| {
                    bucket
                        .first()
                        .is_some_and(|(first, _)| creation >= truncate(*first) - window)
                })
        }
    }
}

fn names(bucket: Vec<(NaiveDateTime, String)>) -> Vec<String> {
    bucket.into_iter().map(|(_, name)| name).collect()
}

fn capped(mut bucket: Vec<String>, capacity: usize, trash: &mut Vec<String>) -> Vec<String> {
    let overflow = bucket.split_off(capacity.min(bucket.len()));

    trash.extend(overflow);

    bucket
}

fn truncate_hour(at: NaiveDateTime) -> NaiveDateTime {
    truncate_day(at) + Duration::hours(i64::from(at.hour()))
}

fn truncate_day(at: NaiveDateTime) -> NaiveDateTime {
    NaiveDateTime::new(at.date(), NaiveTime::MIN)
}

fn truncate_week(at: NaiveDateTime) -> NaiveDateTime {
    truncate_day(at) - Duration::days(i64::from(at.weekday().num_days_from_monday()))
}

fn truncate_month(at: NaiveDateTime) -> NaiveDateTime {
    NaiveDateTime::new(at.date().with_day(1).unwrap_or(at.date()), NaiveTime::MIN)
}

fn truncate_year(at: NaiveDateTime) -> NaiveDateTime {
    NaiveDateTime::new(
        NaiveDate::from_ymd_opt(at.year(), 1, 1).unwrap_or(at.date()),
        NaiveTime::MIN,
    )
}
