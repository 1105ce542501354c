//! Time and token-budget helpers for memory formatting.
//!
//! Prompt blocks never show raw ISO timestamps — memories are labelled with
//! a human recency phrase whose granularity coarsens with age ("Just now",
//! "Yesterday evening", "In November 2025").

use chrono::{DateTime, Datelike, Local, NaiveDateTime, Timelike, Utc};

/// Rough token estimate at ~4 chars per token.
pub fn count_tokens(text: &str) -> usize {
    text.len() / 4
}

/// Current time as an RFC 3339 UTC string, the canonical persisted form.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

/// Current unix time in seconds (throttle state uses this form).
pub fn now_unix() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Parse a persisted timestamp leniently: RFC 3339 first, then a naive
/// datetime treated as local time.
pub fn parse_timestamp(ts: &str) -> Option<DateTime<Local>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(ts) {
        return Some(dt.with_timezone(&Local));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(ts, "%Y-%m-%dT%H:%M:%S%.f") {
        return naive.and_local_timezone(Local).single();
    }
    None
}

fn time_of_day(hour: u32) -> &'static str {
    match hour {
        0..=4 => "night",
        5..=11 => "morning",
        12..=16 => "afternoon",
        17..=20 => "evening",
        _ => "night",
    }
}

/// Human recency label for a timestamp. Falls back to a truncated copy of
/// the input when it doesn't parse.
pub fn humanize_timestamp(ts: &str) -> String {
    humanize_at(ts, Local::now())
}

/// Testable core of [`humanize_timestamp`] with an injected "now".
pub fn humanize_at(ts: &str, now: DateTime<Local>) -> String {
    if ts.is_empty() {
        return String::new();
    }
    let Some(dt) = parse_timestamp(ts) else {
        return ts.chars().take(16).collect();
    };

    let day_delta = (now.date_naive() - dt.date_naive()).num_days();
    let hour_delta = (now - dt).num_seconds() as f64 / 3600.0;
    let mem_tod = time_of_day(dt.hour());
    let now_tod = time_of_day(now.hour());

    match day_delta {
        0 => {
            if hour_delta < 0.0 {
                format!("This {mem_tod}")
            } else if hour_delta < 1.0 {
                "Just now".to_string()
            } else if hour_delta < 3.0 {
                "A couple hours ago".to_string()
            } else if mem_tod == now_tod {
                format!("Earlier this {mem_tod}")
            } else if mem_tod == "night" && dt.hour() >= 21 {
                "Tonight".to_string()
            } else {
                format!("This {mem_tod}")
            }
        }
        1 => {
            if mem_tod == "night" {
                "Last night".to_string()
            } else {
                format!("Yesterday {mem_tod}")
            }
        }
        2..=3 => "A couple days ago".to_string(),
        4..=6 => {
            if dt.iso_week().week() == now.iso_week().week() && dt.year() == now.year() {
                "Earlier this week".to_string()
            } else {
                "A few days ago".to_string()
            }
        }
        7..=13 => "Last week".to_string(),
        14..=20 => "A couple weeks ago".to_string(),
        21..=29 => "A few weeks ago".to_string(),
        _ => {
            let month_delta =
                (now.year() - dt.year()) * 12 + now.month() as i32 - dt.month() as i32;
            match month_delta {
                0 => "Earlier this month".to_string(),
                1 => "Last month".to_string(),
                2 => "A couple months ago".to_string(),
                _ if dt.year() == now.year() => format!("In {}", dt.format("%B")),
                _ => format!("In {}", dt.format("%B %Y")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn local(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn just_now_within_the_hour() {
        let now = local(2026, 8, 1, 14, 0);
        let ts = local(2026, 8, 1, 13, 30).to_rfc3339();
        assert_eq!(humanize_at(&ts, now), "Just now");
    }

    #[test]
    fn same_part_of_day_uses_earlier_this() {
        let now = local(2026, 8, 1, 15, 0);
        let ts = local(2026, 8, 1, 12, 0).to_rfc3339();
        assert_eq!(humanize_at(&ts, now), "Earlier this afternoon");
    }

    #[test]
    fn yesterday_keeps_time_of_day() {
        let now = local(2026, 8, 1, 9, 0);
        let ts = local(2026, 7, 31, 19, 0).to_rfc3339();
        assert_eq!(humanize_at(&ts, now), "Yesterday evening");
    }

    #[test]
    fn late_yesterday_is_last_night() {
        let now = local(2026, 8, 1, 9, 0);
        let ts = local(2026, 7, 31, 23, 0).to_rfc3339();
        assert_eq!(humanize_at(&ts, now), "Last night");
    }

    #[test]
    fn weeks_and_months_coarsen() {
        let now = local(2026, 8, 1, 9, 0);
        assert_eq!(
            humanize_at(&local(2026, 7, 23, 9, 0).to_rfc3339(), now),
            "Last week"
        );
        assert_eq!(
            humanize_at(&local(2025, 11, 10, 9, 0).to_rfc3339(), now),
            "In November 2025"
        );
    }

    #[test]
    fn unparseable_falls_back_to_truncation() {
        let now = local(2026, 8, 1, 9, 0);
        assert_eq!(humanize_at("not a time", now), "not a time");
    }

    #[test]
    fn token_estimate_is_quarter_of_chars() {
        assert_eq!(count_tokens("abcdefgh"), 2);
    }
}
