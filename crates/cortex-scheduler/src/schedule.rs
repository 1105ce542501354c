//! Schedule grammar parsing and due-time evaluation.
//!
//! Evaluation is a pure function of (schedule, now, last_run) so every
//! branch is testable without a clock.

use chrono::{Datelike, Duration, NaiveDateTime, Timelike};

use crate::error::{Result, SchedulerError};

/// Catch-up grace for missed daily-equivalent crons.
const CATCH_UP_HOURS: i64 = 6;

#[derive(Debug, Clone, PartialEq)]
pub enum Schedule {
    Every { count: i64, unit: EveryUnit },
    DailyAt { hour: u32, minute: u32 },
    OnceAt { at: NaiveDateTime },
    Cron(CronSpec),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EveryUnit {
    Minute,
    Hour,
    Day,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CronSpec {
    pub minute: String,
    pub hour: String,
    pub dom: String,
    pub month: String,
    pub dow: String,
}

/// What the tick loop should do with a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Decision {
    pub fire: bool,
    /// One-shot schedules deactivate after firing.
    pub deactivate: bool,
}

/// Parse a schedule string. Case-insensitive; surrounding whitespace is
/// ignored.
pub fn parse_schedule(text: &str) -> Result<Schedule> {
    let raw = text.trim();
    let lower = raw.to_lowercase();

    if let Some(rest) = lower.strip_prefix("every ") {
        if let Some(schedule) = parse_every(rest) {
            return Ok(schedule);
        }
    }
    if let Some(rest) = lower.strip_prefix("daily at ") {
        if let Some((hour, minute)) = parse_daily_time(rest.trim()) {
            return Ok(Schedule::DailyAt { hour, minute });
        }
    }
    if let Some(rest) = lower.strip_prefix("once at ") {
        // Parse against the original casing; ISO is case-sensitive only in
        // the T/Z markers, which lowercase parsing also accepts.
        let target = raw[raw.len() - rest.len()..].trim();
        if let Some(at) = parse_iso_naive(target) {
            return Ok(Schedule::OnceAt { at });
        }
    }
    if let Some(spec) = parse_cron(raw) {
        return Ok(Schedule::Cron(spec));
    }

    Err(SchedulerError::BadSchedule(text.to_string()))
}

fn parse_every(rest: &str) -> Option<Schedule> {
    let mut tokens = rest.split_whitespace().peekable();
    let first = tokens.peek()?;
    let count = match first.parse::<i64>() {
        Ok(n) if n > 0 => {
            tokens.next();
            n
        }
        _ => 1,
    };
    let unit_token = tokens.next()?;
    let unit = match unit_token.trim_end_matches('s') {
        "minute" => EveryUnit::Minute,
        "hour" => EveryUnit::Hour,
        "day" => EveryUnit::Day,
        _ => return None,
    };
    Some(Schedule::Every { count, unit })
}

/// `HH:MM`, optionally suffixed `am`/`pm` (12-hour clock).
fn parse_daily_time(text: &str) -> Option<(u32, u32)> {
    let (clock, meridiem) = if let Some(c) = text.strip_suffix("pm") {
        (c.trim(), Some("pm"))
    } else if let Some(c) = text.strip_suffix("am") {
        (c.trim(), Some("am"))
    } else {
        (text, None)
    };

    let (h, m) = clock.split_once(':')?;
    let mut hour: u32 = h.trim().parse().ok()?;
    let minute: u32 = m.trim().parse().ok()?;
    if minute > 59 {
        return None;
    }
    match meridiem {
        Some("pm") if hour != 12 => hour += 12,
        Some("am") if hour == 12 => hour = 0,
        _ => {}
    }
    if hour > 23 {
        return None;
    }
    Some((hour, minute))
}

fn parse_iso_naive(text: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S") {
        return Some(dt);
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(dt);
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M") {
        return Some(dt);
    }
    // Full RFC 3339 timestamps are accepted with their offset dropped: the
    // scheduler works in server-local wall time.
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(text) {
        return Some(dt.naive_local());
    }
    None
}

fn parse_cron(text: &str) -> Option<CronSpec> {
    let fields: Vec<&str> = text.split_whitespace().collect();
    if fields.len() != 5 {
        return None;
    }
    let valid = |f: &str| {
        !f.is_empty()
            && f.chars()
                .all(|c| c.is_ascii_digit() || matches!(c, ',' | '-' | '*' | '/'))
    };
    if !fields.iter().all(|f| valid(f)) {
        return None;
    }
    Some(CronSpec {
        minute: fields[0].to_string(),
        hour: fields[1].to_string(),
        dom: fields[2].to_string(),
        month: fields[3].to_string(),
        dow: fields[4].to_string(),
    })
}

/// Match one cron field against a current value. Supports `*`, `*/n`,
/// comma lists of literals, ranges `a-b`, and stepped ranges `a-b/n`.
pub fn cron_field_matches(field: &str, current: u32) -> bool {
    if field == "*" {
        return true;
    }
    if let Some(step) = field.strip_prefix("*/") {
        return match step.parse::<u32>() {
            Ok(step) if step > 0 => current % step == 0,
            _ => false,
        };
    }
    for part in field.split(',') {
        let part = part.trim();
        if let Some((range, step)) = part.split_once('/') {
            let Ok(step) = step.parse::<u32>() else {
                continue;
            };
            if step == 0 {
                continue;
            }
            if let Some((lo, hi)) = range.split_once('-') {
                if let (Ok(lo), Ok(hi)) = (lo.parse::<u32>(), hi.parse::<u32>()) {
                    if lo <= current && current <= hi && (current - lo) % step == 0 {
                        return true;
                    }
                }
            }
        } else if let Some((lo, hi)) = part.split_once('-') {
            if let (Ok(lo), Ok(hi)) = (lo.parse::<u32>(), hi.parse::<u32>()) {
                if lo <= current && current <= hi {
                    return true;
                }
            }
        } else if part.parse::<u32>() == Ok(current) {
            return true;
        }
    }
    false
}

/// Server weekday (Mon=0) translated to cron weekday (Sun=0).
fn cron_dow(now: NaiveDateTime) -> u32 {
    (now.weekday().num_days_from_monday() + 1) % 7
}

/// Decide whether a schedule is due at `now` given the task's `last_run`.
pub fn evaluate(
    schedule: &Schedule,
    now: NaiveDateTime,
    last_run: Option<NaiveDateTime>,
) -> Decision {
    match schedule {
        Schedule::Every { count, unit } => {
            let delta = match unit {
                EveryUnit::Minute => Duration::minutes(*count),
                EveryUnit::Hour => Duration::hours(*count),
                EveryUnit::Day => Duration::days(*count),
            };
            let fire = match last_run {
                None => true,
                Some(last) => now - last >= delta,
            };
            Decision {
                fire,
                deactivate: false,
            }
        }

        Schedule::DailyAt { hour, minute } => {
            let target = now
                .date()
                .and_hms_opt(*hour, *minute, 0)
                .expect("validated at parse");
            // Past today's target, and no run since the target.
            let fire = now >= target && last_run.map_or(true, |last| last < target);
            Decision {
                fire,
                deactivate: false,
            }
        }

        Schedule::OnceAt { at } => {
            let fire = now >= *at;
            Decision {
                fire,
                deactivate: fire,
            }
        }

        Schedule::Cron(spec) => evaluate_cron(spec, now, last_run),
    }
}

fn evaluate_cron(spec: &CronSpec, now: NaiveDateTime, last_run: Option<NaiveDateTime>) -> Decision {
    let dow = cron_dow(now);
    let matches_now = cron_field_matches(&spec.minute, now.minute())
        && cron_field_matches(&spec.hour, now.hour())
        && cron_field_matches(&spec.dom, now.day())
        && cron_field_matches(&spec.month, now.month())
        && cron_field_matches(&spec.dow, dow);

    if matches_now {
        // In the right minute; fire unless we already ran this minute.
        let minute_start = now
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(now);
        let fire = last_run.map_or(true, |last| last < minute_start);
        return Decision {
            fire,
            deactivate: false,
        };
    }

    // Catch-up applies only to daily-equivalent crons: a literal
    // minute+hour with wildcard day-of-month and month (any weekday
    // constraint still honored). Specific-date schedules never catch up.
    let (Ok(sched_min), Ok(sched_hour)) = (spec.minute.parse::<u32>(), spec.hour.parse::<u32>())
    else {
        return Decision::default();
    };
    if spec.dom != "*" || spec.month != "*" {
        return Decision::default();
    }
    if !cron_field_matches(&spec.dow, dow) {
        return Decision::default();
    }
    let Some(target) = now.date().and_hms_opt(sched_hour, sched_min, 0) else {
        return Decision::default();
    };
    if now <= target {
        return Decision::default();
    }
    let missed = last_run.map_or(true, |last| last < target);
    let within_grace = now - target <= Duration::hours(CATCH_UP_HOURS);
    Decision {
        fire: missed && within_grace,
        deactivate: false,
    }
}
