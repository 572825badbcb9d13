use chrono::{NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Whether a session window records students entering or leaving. Lateness
/// only applies to entry scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }

    pub fn parse(s: &str) -> Option<Direction> {
        match s.trim() {
            "in" => Some(Direction::In),
            "out" => Some(Direction::Out),
            _ => None,
        }
    }
}

/// A named scanning window within one calendar date. `opens`/`closes` and
/// `late_after` are "HH:MM" minute-of-day strings; `opens <= closes` is the
/// schedule author's responsibility, as is non-overlap between windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionWindow {
    pub id: String,
    pub name: String,
    pub opens: String,
    pub closes: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub late_after: Option<String>,
    pub direction: Direction,
}

/// Ordered mapping from date key ("YYYY-MM-DD") to that date's session
/// windows, in the order the schedule lists them. Date keys are unique by
/// construction; listed order within a date is authoritative for resolution.
pub type EventSchedule = BTreeMap<String, Vec<SessionWindow>>;

/// Outcome of matching a moment against a schedule. Exactly one of
/// `session` / `denial_reason` is set.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub session: Option<SessionWindow>,
    pub date_key: String,
    pub denial_reason: Option<String>,
}

pub fn minute_of_day(hhmm: &str) -> Option<u32> {
    let (h, m) = hhmm.trim().split_once(':')?;
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    if h > 23 || m > 59 {
        return None;
    }
    Some(h * 60 + m)
}

/// 12-hour clock rendering for denial messages; drops ":00" minutes.
/// "19:00" -> "7 PM", "07:30" -> "7:30 AM", "00:05" -> "12:05 AM".
pub fn friendly_time(hhmm: &str) -> String {
    let Some(total) = minute_of_day(hhmm) else {
        return hhmm.trim().to_string();
    };
    let h24 = total / 60;
    let m = total % 60;
    let suffix = if h24 < 12 { "AM" } else { "PM" };
    let h12 = match h24 % 12 {
        0 => 12,
        h => h,
    };
    if m == 0 {
        format!("{} {}", h12, suffix)
    } else {
        format!("{}:{:02} {}", h12, m, suffix)
    }
}

fn now_minutes(now: NaiveDateTime) -> u32 {
    now.time().hour() * 60 + now.time().minute()
}

/// Finds the session open at `now`, if any. First listed window containing
/// the moment wins (inclusive on both ends; a scan at the exact closing
/// minute is still valid). When nothing is open, the denial reason names the
/// earliest not-yet-open window, or says the day is over / unscheduled.
pub fn resolve(schedule: &EventSchedule, now: NaiveDateTime) -> Resolution {
    let date_key = now.date().format("%Y-%m-%d").to_string();
    let minutes = now_minutes(now);

    let sessions = match schedule.get(&date_key) {
        Some(list) if !list.is_empty() => list,
        _ => {
            return Resolution {
                session: None,
                date_key,
                denial_reason: Some("no scanning scheduled for today".to_string()),
            }
        }
    };

    for s in sessions {
        let (Some(opens), Some(closes)) = (minute_of_day(&s.opens), minute_of_day(&s.closes))
        else {
            // Malformed window: never matches, never blocks later windows.
            continue;
        };
        if opens <= minutes && minutes <= closes {
            return Resolution {
                session: Some(s.clone()),
                date_key,
                denial_reason: None,
            };
        }
    }

    let upcoming = sessions
        .iter()
        .filter_map(|s| {
            minute_of_day(&s.opens)
                .filter(|o| *o > minutes)
                .map(|o| (o, s))
        })
        .min_by_key(|(o, _)| *o);

    let reason = match upcoming {
        Some((_, s)) => format!("{} starts at {}", s.name, friendly_time(&s.opens)),
        None => "all of today's sessions have ended".to_string(),
    };

    Resolution {
        session: None,
        date_key,
        denial_reason: Some(reason),
    }
}

/// Lateness for a resolved session. Exit windows and windows without a
/// `lateAfter` threshold are never late; otherwise strictly after the
/// threshold minute is late (the threshold minute itself is on time).
pub fn is_late(session: &SessionWindow, now: NaiveDateTime) -> bool {
    if session.direction == Direction::Out {
        return false;
    }
    let Some(threshold) = session.late_after.as_deref().and_then(minute_of_day) else {
        return false;
    };
    now_minutes(now) > threshold
}
