use anyhow::Context;
use chrono::{DateTime, Duration, NaiveDate, Utc};

pub const DEFAULT_WINDOW_DAYS: i64 = 30;

/// Half-open `[start, end)` window for savings reports.
///
/// `since`/`until` are `YYYY-MM-DD` UTC dates; `until` is inclusive of the whole day.
/// `days` counts back from `now`. With nothing set, the last 30 days are used.
pub fn resolve_window(
    since: Option<&str>,
    until: Option<&str>,
    days: Option<i64>,
    now: DateTime<Utc>,
) -> anyhow::Result<(DateTime<Utc>, DateTime<Utc>)> {
    if days.is_some() && since.is_some() {
        anyhow::bail!("use either since/until or days, not both");
    }

    let end = match until {
        Some(s) => start_of_day(parse_date(s)? + Duration::days(1)),
        None => now,
    };

    let start = match (since, days) {
        (Some(s), _) => start_of_day(parse_date(s)?),
        (None, Some(d)) => {
            anyhow::ensure!(d > 0, "days must be > 0 (got {d})");
            end - Duration::days(d)
        }
        (None, None) => end - Duration::days(DEFAULT_WINDOW_DAYS),
    };

    anyhow::ensure!(start < end, "window start {start} is not before end {end}");
    Ok((start, end))
}

fn parse_date(s: &str) -> anyhow::Result<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .with_context(|| format!("invalid date (expected YYYY-MM-DD): {s}"))
}

fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(chrono::NaiveTime::MIN).and_utc()
}
