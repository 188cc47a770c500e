//! Sensor schedule window, in local server time.
//!
//! - Sunday: never.
//! - Thursday: hour ∈ [8, 20).
//! - Every other day: hour ∈ [8, 18).
//!
//! Both intervals are half-open: 18:00:00 sharp on a Monday is outside.

use chrono::{Datelike, Local, NaiveDateTime, Timelike, Weekday};

/// Whether the sensor may do work right now.
pub fn is_within_schedule() -> bool {
    window_allows(Local::now().naive_local())
}

/// Pure window check, split out for testability.
pub fn window_allows(now: NaiveDateTime) -> bool {
    let hour = now.hour();
    match now.weekday() {
        Weekday::Sun => false,
        Weekday::Thu => (8..20).contains(&hour),
        _ => (8..18).contains(&hour),
    }
}

/// Human-readable skip reason used in logs.
pub fn describe(now: NaiveDateTime) -> String {
    format!(
        "{} {:02}h — window is Mon-Sat 8h-18h, Thu 8h-20h, closed Sunday",
        now.weekday(),
        now.hour()
    )
}
