// Calendar-day helpers. All dates in the system are plain calendar days
// interpreted as UTC midnight; there is no timezone handling anywhere else.

use chrono::{NaiveDate, Utc};

// Iterate every day from `start` to `end` inclusive.
// An inverted range yields nothing.
pub fn days_inclusive(start: NaiveDate, end: NaiveDate) -> impl Iterator<Item = NaiveDate> {
    start.iter_days().take_while(move |day| *day <= end)
}

// Today as a calendar day in UTC
pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}
