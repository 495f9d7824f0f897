use time::{Date, Duration, Month, OffsetDateTime};

/// Boundaries of a monthly billing cycle and how much of it is left at a
/// given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleWindow {
    pub cycle_start: OffsetDateTime,
    pub cycle_end: OffsetDateTime,
    /// Always at least 1.
    pub total_days: i64,
    /// Between 0 and `total_days`.
    pub remaining_days: i64,
}

impl CycleWindow {
    /// Cycle anchored on a prior charge (or on `now` for a first purchase).
    pub fn anchored(anchor: Option<OffsetDateTime>, now: OffsetDateTime) -> Self {
        let start = anchor.unwrap_or(now);
        Self::between(start, add_one_month(start), now)
    }

    /// Cycle with explicit boundaries, measured at `at`.
    pub fn between(
        cycle_start: OffsetDateTime,
        cycle_end: OffsetDateTime,
        at: OffsetDateTime,
    ) -> Self {
        let total_days = ceil_days(cycle_end - cycle_start).max(1);
        let remaining_days = ceil_days(cycle_end - at).min(total_days);
        Self {
            cycle_start,
            cycle_end,
            total_days,
            remaining_days,
        }
    }

    pub fn has_ended(&self) -> bool {
        self.remaining_days == 0
    }
}

/// Same day-of-month one calendar month later, clamped to the month's length
/// (Jan 31 -> Feb 28/29).
pub fn add_one_month(start: OffsetDateTime) -> OffsetDateTime {
    let (year, month) = match start.month() {
        Month::December => (start.year() + 1, Month::January),
        month => (start.year(), month.next()),
    };
    let last_day = month.length(year);
    match Date::from_calendar_date(year, month, start.day().min(last_day)) {
        Ok(date) => start.replace_date(date),
        Err(_) => start + Duration::days(i64::from(last_day)),
    }
}

/// Whole days, rounded up; non-positive spans count as 0.
fn ceil_days(span: Duration) -> i64 {
    let nanos = span.whole_nanoseconds();
    if nanos <= 0 {
        return 0;
    }
    let day = Duration::DAY.whole_nanoseconds();
    ((nanos + day - 1) / day) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn month_end_is_clamped() {
        assert_eq!(
            add_one_month(datetime!(2026-01-31 10:00 UTC)),
            datetime!(2026-02-28 10:00 UTC)
        );
        assert_eq!(
            add_one_month(datetime!(2028-01-31 10:00 UTC)),
            datetime!(2028-02-29 10:00 UTC)
        );
        assert_eq!(
            add_one_month(datetime!(2026-12-15 08:30 UTC)),
            datetime!(2027-01-15 08:30 UTC)
        );
    }

    #[test]
    fn first_purchase_has_full_window() {
        let now = datetime!(2026-04-01 00:00 UTC);
        let window = CycleWindow::anchored(None, now);
        assert_eq!(window.cycle_start, now);
        assert_eq!(window.total_days, 30);
        assert_eq!(window.remaining_days, 30);
    }

    #[test]
    fn mid_cycle_days_round_up() {
        let start = datetime!(2026-04-01 00:00 UTC);
        let window = CycleWindow::anchored(Some(start), datetime!(2026-04-16 00:00 UTC));
        assert_eq!(window.total_days, 30);
        assert_eq!(window.remaining_days, 15);

        let window = CycleWindow::anchored(Some(start), datetime!(2026-04-16 00:00:01 UTC));
        assert_eq!(window.remaining_days, 15);

        let window = CycleWindow::anchored(Some(start), datetime!(2026-04-15 23:59 UTC));
        assert_eq!(window.remaining_days, 16);
    }

    #[test]
    fn expired_cycle_has_nothing_remaining() {
        let start = datetime!(2026-01-01 00:00 UTC);
        let window = CycleWindow::anchored(Some(start), datetime!(2026-03-01 00:00 UTC));
        assert_eq!(window.remaining_days, 0);
        assert!(window.has_ended());
    }

    #[test]
    fn day_counts_stay_in_bounds() {
        let start = datetime!(2026-04-01 00:00 UTC);
        // clock behind the anchor
        let window = CycleWindow::anchored(Some(start), datetime!(2026-03-20 00:00 UTC));
        assert_eq!(window.remaining_days, window.total_days);

        let degenerate = CycleWindow::between(start, start, start);
        assert_eq!(degenerate.total_days, 1);
        assert_eq!(degenerate.remaining_days, 0);
    }
}
