use crate::backup_error::BackupError;
use crate::pool::Snapshot;
use chrono::{Datelike, Duration, Months, NaiveDate, NaiveDateTime, Weekday};

/// A parsed retention policy: expressions joined by the literal separator
/// ` and `, matching a snapshot when any of them matches.
///
/// Evaluation is against a caller-supplied `now` so that matching stays
/// deterministic in tests.
#[derive(Debug, PartialEq, Clone)]
pub struct Matcher {
    rules: Vec<Rule>,
}

#[derive(Debug, PartialEq, Clone)]
enum Rule {
    All,
    Never,
    Hours(u32),
    Days(u32),
    Weeks(u32),
    OnWeekday { weeks: u32, weekday: Weekday },
    NthWeekdayOfMonth { months: u32, nth: u32, weekday: Weekday },
    NthDayOfMonth { months: u32, day: u32 },
    NthDayOfQuarter { quarters: u32, day: u32 },
    NameSuffix(String),
}

impl Matcher {
    pub fn parse(policy: &str) -> Result<Self, BackupError> {
        let rules = policy
            .split(" and ")
            .map(Rule::parse)
            .collect::<Result<Vec<Rule>, BackupError>>()?;

        Ok(Matcher { rules })
    }

    pub fn matches(&self, snapshot: &Snapshot, now: NaiveDateTime) -> bool {
        self.rules.iter().any(|rule| {
            let matched = rule.matches(snapshot, now);

            if matched {
                log::debug!(
                    "snapshot \"{}\" matches policy rule {:?}",
                    snapshot.name(),
                    rule
                );
            }

            matched
        })
    }
}

impl Rule {
    fn parse(expression: &str) -> Result<Self, BackupError> {
        let expression = expression.trim();

        match expression {
            "all" => return Ok(Rule::All),
            "none" => return Ok(Rule::Never),
            _ => {}
        }

        if let Some(suffix) = expression.strip_prefix('@') {
            if !suffix.is_empty() && !suffix.contains(' ') {
                return Ok(Rule::NameSuffix(suffix.to_string()));
            }
        }

        let tokens: Vec<&str> = expression.split(' ').collect();

        let parsed = match tokens.as_slice() {
            &[count, unit] => count.parse::<u32>().ok().and_then(|n| {
                let unit = unit.strip_suffix('s').unwrap_or(unit);

                match unit {
                    "hour" => Some(Rule::Hours(n)),
                    "day" => Some(Rule::Days(n)),
                    "week" => Some(Rule::Weeks(n)),
                    _ => parse_weekday(unit).map(|weekday| Rule::OnWeekday { weeks: n, weekday }),
                }
            }),
            &[count, nth, "day", "of", "the", "month"] => {
                match (count.parse::<u32>().ok(), parse_ordinal(nth)) {
                    (Some(months), Some(day)) => Some(Rule::NthDayOfMonth { months, day }),
                    _ => None,
                }
            }
            &[count, nth, "day", "of", "the", "quarter"] => {
                match (count.parse::<u32>().ok(), parse_ordinal(nth)) {
                    (Some(quarters), Some(day)) => Some(Rule::NthDayOfQuarter { quarters, day }),
                    _ => None,
                }
            }
            &[count, nth, weekday, "of", "the", "month"] => {
                match (count.parse::<u32>().ok(), parse_ordinal(nth), parse_weekday(weekday)) {
                    (Some(months), Some(nth), Some(weekday)) => Some(Rule::NthWeekdayOfMonth {
                        months,
                        nth,
                        weekday,
                    }),
                    _ => None,
                }
            }
            _ => None,
        };

        parsed.ok_or(BackupError::Config(format!(
            "unknown policy: {}",
            expression
        )))
    }

    fn matches(&self, snapshot: &Snapshot, now: NaiveDateTime) -> bool {
        match self {
            Rule::All => return true,
            Rule::Never => return false,
            Rule::NameSuffix(suffix) => {
                return snapshot
                    .name()
                    .rsplit_once('@')
                    .is_some_and(|(_, name_suffix)| name_suffix == suffix.as_str())
            }
            _ => {}
        }

        let Some(creation) = snapshot.creation() else {
            return false;
        };

        match self {
            Rule::Hours(n) => creation >= now - Duration::hours(i64::from(*n)),
            Rule::Days(n) => creation.date() >= now.date() - Duration::days(i64::from(*n)),
            Rule::Weeks(n) => creation.date() >= now.date() - Duration::weeks(i64::from(*n)),
            Rule::OnWeekday { weeks, weekday } => {
                creation.weekday() == *weekday
                    && creation.date() >= now.date() - Duration::weeks(i64::from(*weeks))
            }
            Rule::NthWeekdayOfMonth {
                months,
                nth,
                weekday,
            } => {
                // the fifth occurrence covers days 29 to 31
                let occurrence = (creation.day() - 1) / 7 + 1;
                let lookback = if weekday_seen_this_month(now.date(), *weekday) {
                    months.saturating_sub(1)
                } else {
                    *months
                };

                creation.weekday() == *weekday
                    && occurrence == *nth
                    && creation.date() >= sub_months(month_start(now.date()), lookback)
            }
            Rule::NthDayOfMonth { months, day } => {
                creation.day() == *day
                    && creation.date()
                        >= sub_months(month_start(now.date()), months.saturating_sub(1))
            }
            Rule::NthDayOfQuarter { quarters, day } => {
                creation.day() == *day
                    && creation.month0() % 3 == 0
                    && creation.date() >= sub_months(month_start(now.date()), quarters * 3)
            }
            Rule::All | Rule::Never | Rule::NameSuffix(_) => false,
        }
    }
}

fn parse_weekday(token: &str) -> Option<Weekday> {
    match token {
        "monday" => Some(Weekday::Mon),
        "tuesday" => Some(Weekday::Tue),
        "wednesday" => Some(Weekday::Wed),
        "thursday" => Some(Weekday::Thu),
        "friday" => Some(Weekday::Fri),
        "saturday" => Some(Weekday::Sat),
        "sunday" => Some(Weekday::Sun),
        _ => None,
    }
}

fn parse_ordinal(token: &str) -> Option<u32> {
    let digits = token.trim_end_matches(|c: char| c.is_ascii_alphabetic());

    match &token[digits.len()..] {
        "st" | "nd" | "rd" | "th" => digits.parse().ok(),
        _ => None,
    }
}

fn month_start(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

fn sub_months(date: NaiveDate, months: u32) -> NaiveDate {
    date.checked_sub_months(Months::new(months))
        .unwrap_or(NaiveDate::MIN)
}

/// Reports whether the most recent occurrence of `weekday` strictly before
/// `today` falls within the current month.
fn weekday_seen_this_month(today: NaiveDate, weekday: Weekday) -> bool {
    (1..=7)
        .filter_map(|days_back| today.checked_sub_days(chrono::Days::new(days_back)))
        .find(|candidate| candidate.weekday() == weekday)
        .is_some_and(|candidate| candidate.month() == today.month() && candidate.year() == today.year())
}
