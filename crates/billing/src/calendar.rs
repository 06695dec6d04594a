//! Calendar arithmetic for billing periods and quota windows
//!
//! Billing periods are monthly and pinned to an anchor day-of-month; quota
//! windows are fixed UTC calendar days. The two are independent.

use time::{Date, Duration, Month, OffsetDateTime, Time, UtcOffset};

use crate::error::{BillingError, BillingResult};

/// Advance `from` by `months` calendar months, landing on `anchor_day` or
/// the last day of the target month when it is shorter.
///
/// Jan 31 -> Feb 28 (29 in leap years) -> Mar 31 with anchor 31.
pub fn add_months_anchored(
    from: OffsetDateTime,
    months: u32,
    anchor_day: u8,
) -> BillingResult<OffsetDateTime> {
    let zero_based = i64::from(u8::from(from.month())) - 1 + i64::from(months);
    let year = i64::from(from.year()) + zero_based.div_euclid(12);
    let month_index = zero_based.rem_euclid(12) + 1;

    let year = i32::try_from(year)
        .map_err(|_| BillingError::Internal(format!("billing period year {} out of range", year)))?;
    let month = u8::try_from(month_index)
        .ok()
        .and_then(|m| Month::try_from(m).ok())
        .ok_or_else(|| {
            BillingError::Internal(format!("invalid month index {}", month_index))
        })?;

    let date = clamp_day(year, month, anchor_day)?;
    Ok(from.replace_date(date))
}

fn clamp_day(year: i32, month: Month, anchor_day: u8) -> BillingResult<Date> {
    let mut day = anchor_day.clamp(1, 31);
    loop {
        match Date::from_calendar_date(year, month, day) {
            Ok(date) => return Ok(date),
            Err(_) if day > 28 => day -= 1,
            Err(e) => {
                return Err(BillingError::Internal(format!(
                    "cannot build date {}-{}-{}: {}",
                    year, month, day, e
                )))
            }
        }
    }
}

/// Quota window containing `at`
pub fn utc_day(at: OffsetDateTime) -> Date {
    at.to_offset(UtcOffset::UTC).date()
}

/// Start of the next UTC calendar day
pub fn next_utc_midnight(at: OffsetDateTime) -> OffsetDateTime {
    let today = utc_day(at);
    let tomorrow = today.next_day().unwrap_or(today);
    tomorrow.with_time(Time::MIDNIGHT).assume_utc()
}

/// Seconds until the quota window containing `at` closes, at least one
pub fn seconds_until_reset(at: OffsetDateTime) -> u64 {
    let remaining: Duration = next_utc_midnight(at) - at;
    u64::try_from(remaining.whole_seconds()).unwrap_or(0).max(1)
}
