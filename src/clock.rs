use chrono::{Local, NaiveDateTime};

/// Device-local timestamp format used everywhere a moment is persisted or
/// sent over the wire.
pub const STAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

pub fn stamp(t: NaiveDateTime) -> String {
    t.format(STAMP_FORMAT).to_string()
}

pub fn parse_stamp(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s.trim(), STAMP_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(s.trim(), "%Y-%m-%dT%H:%M"))
        .ok()
}

/// Source of the current device-local moment. Session resolution and
/// lateness are pure functions of the value returned here, so tests pin it.
pub trait Clock {
    fn now(&self) -> NaiveDateTime;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// Clock pinned to a single moment.
pub struct FixedClock(pub NaiveDateTime);

impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        self.0
    }
}
