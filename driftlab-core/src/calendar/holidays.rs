//! NYSE holiday and early-close rules, computed from first principles.
//!
//! Covers the modern rule set (post-2022 includes Juneteenth). Special
//! one-off closures (national days of mourning, weather) are not modelled.

use chrono::{Datelike, Duration, NaiveDate, Weekday};

/// Easter Sunday (anonymous Gregorian algorithm).
fn easter_sunday(year: i32) -> Option<NaiveDate> {
    let a = year % 19;
    let b = year / 100;
    let c = year % 100;
    let d = b / 4;
    let e = b % 4;
    let f = (b + 8) / 25;
    let g = (b - f + 1) / 3;
    let h = (19 * a + b - d - g + 15) % 30;
    let i = c / 4;
    let k = c % 4;
    let l = (32 + 2 * e + 2 * i - h - k) % 7;
    let m = (a + 11 * h + 22 * l) / 451;
    let month = (h + l - 7 * m + 114) / 31;
    let day = (h + l - 7 * m + 114) % 31 + 1;
    NaiveDate::from_ymd_opt(year, month as u32, day as u32)
}

/// The `n`-th (1-based) `weekday` of a month.
fn nth_weekday(year: i32, month: u32, weekday: Weekday, n: u32) -> Option<NaiveDate> {
    NaiveDate::from_weekday_of_month_opt(year, month, weekday, n as u8)
}

fn last_weekday(year: i32, month: u32, weekday: Weekday) -> Option<NaiveDate> {
    let next_month = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    }?;
    let mut day = next_month - Duration::days(1);
    while day.weekday() != weekday {
        day -= Duration::days(1);
    }
    Some(day)
}

/// Saturday holidays are observed on Friday, Sunday holidays on Monday.
fn observed(date: NaiveDate) -> NaiveDate {
    match date.weekday() {
        Weekday::Sat => date - Duration::days(1),
        Weekday::Sun => date + Duration::days(1),
        _ => date,
    }
}

/// All full-day NYSE closures in `year`.
pub fn nyse_holidays(year: i32) -> Vec<NaiveDate> {
    let mut days = Vec::with_capacity(10);

    // New Year's Day. A Saturday New Year is not observed on the prior Friday.
    if let Some(ny) = NaiveDate::from_ymd_opt(year, 1, 1) {
        if ny.weekday() != Weekday::Sat {
            days.push(observed(ny));
        }
    }
    days.extend(nth_weekday(year, 1, Weekday::Mon, 3)); // MLK
    days.extend(nth_weekday(year, 2, Weekday::Mon, 3)); // Presidents
    days.extend(easter_sunday(year).map(|e| e - Duration::days(2))); // Good Friday
    days.extend(last_weekday(year, 5, Weekday::Mon)); // Memorial
    if year >= 2022 {
        days.extend(NaiveDate::from_ymd_opt(year, 6, 19).map(observed));
    }
    days.extend(NaiveDate::from_ymd_opt(year, 7, 4).map(observed));
    days.extend(nth_weekday(year, 9, Weekday::Mon, 1)); // Labor
    days.extend(nth_weekday(year, 11, Weekday::Thu, 4)); // Thanksgiving
    days.extend(NaiveDate::from_ymd_opt(year, 12, 25).map(observed));

    days.sort();
    days
}

pub fn is_nyse_holiday(date: NaiveDate) -> bool {
    nyse_holidays(date.year()).contains(&date)
}

/// 13:00 closes: July 3rd, the day after Thanksgiving, Christmas Eve.
pub fn is_nyse_early_close(date: NaiveDate) -> bool {
    if matches!(date.weekday(), Weekday::Sat | Weekday::Sun) || is_nyse_holiday(date) {
        return false;
    }
    let year = date.year();
    let july_3 = NaiveDate::from_ymd_opt(year, 7, 3);
    let black_friday = nth_weekday(year, 11, Weekday::Thu, 4).map(|t| t + Duration::days(1));
    let christmas_eve = NaiveDate::from_ymd_opt(year, 12, 24);
    Some(date) == july_3 || Some(date) == black_friday || Some(date) == christmas_eve
}
