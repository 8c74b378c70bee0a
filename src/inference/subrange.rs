//! Splitting an inference range into month-aligned blocks.
//!
//! Block boundaries fall on the first day of every month whose absolute index
//! (`year * 12 + month0`) is a multiple of the block length, so three-month
//! blocks line up with calendar quarters whatever the range start is. The first
//! block starts at `range.start` and the last one is clamped to `range.end`.

use chrono::{Datelike, NaiveDate};

use crate::domain::DateRange;

/// Contiguous, non-overlapping sub-ranges whose union is exactly `range`.
///
/// `months == 0` is treated as 1.
pub fn split_range(range: DateRange, months: u32) -> Vec<DateRange> {
    let months = i64::from(months.max(1));
    let mut out = Vec::new();
    let mut cur = range.start;
    loop {
        let end = next_boundary(cur, months)
            .and_then(|b| b.pred_opt())
            .map_or(range.end, |d| d.min(range.end));
        out.push(DateRange { start: cur, end });
        match end.succ_opt() {
            Some(next) if end < range.end => cur = next,
            _ => break,
        }
    }
    out
}

/// First day of the next aligned block strictly after `date`.
fn next_boundary(date: NaiveDate, months: i64) -> Option<NaiveDate> {
    let idx = i64::from(date.year()) * 12 + i64::from(date.month0());
    let next = (idx.div_euclid(months) + 1) * months;
    let year = i32::try_from(next.div_euclid(12)).ok()?;
    let month = u32::try_from(next.rem_euclid(12)).ok()? + 1;
    NaiveDate::from_ymd_opt(year, month, 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn assert_partition(range: DateRange, parts: &[DateRange]) {
        assert_eq!(parts.first().unwrap().start, range.start);
        assert_eq!(parts.last().unwrap().end, range.end);
        for p in parts {
            assert!(p.start <= p.end);
        }
        for pair in parts.windows(2) {
            assert_eq!(pair[0].end.succ_opt().unwrap(), pair[1].start);
        }
        let covered: i64 = parts.iter().map(|p| p.num_days()).sum();
        assert_eq!(covered, range.num_days());
    }

    #[test]
    fn calendar_year_splits_into_quarters() {
        let year = DateRange::new(d(2024, 1, 1), d(2024, 12, 31)).unwrap();
        let parts = split_range(year, 3);
        let bounds: Vec<(NaiveDate, NaiveDate)> = parts.iter().map(|p| (p.start, p.end)).collect();
        assert_eq!(
            bounds,
            vec![
                (d(2024, 1, 1), d(2024, 3, 31)),
                (d(2024, 4, 1), d(2024, 6, 30)),
                (d(2024, 7, 1), d(2024, 9, 30)),
                (d(2024, 10, 1), d(2024, 12, 31)),
            ]
        );
        assert_partition(year, &parts);
    }

    #[test]
    fn unaligned_range_is_clamped_at_both_ends() {
        let range = DateRange::new(d(2023, 2, 15), d(2024, 5, 10)).unwrap();
        let parts = split_range(range, 3);
        assert_eq!(parts[0].start, d(2023, 2, 15));
        assert_eq!(parts[0].end, d(2023, 3, 31));
        assert_eq!(parts.last().unwrap().start, d(2024, 4, 1));
        assert_partition(range, &parts);
    }

    #[test]
    fn single_day_and_monthly_blocks() {
        let day = DateRange::new(d(2024, 6, 30), d(2024, 6, 30)).unwrap();
        assert_eq!(split_range(day, 3), vec![day]);

        let range = DateRange::new(d(2024, 1, 20), d(2024, 4, 2)).unwrap();
        let parts = split_range(range, 1);
        assert_eq!(parts.len(), 4);
        assert_partition(range, &parts);
    }

    #[test]
    fn twelve_month_blocks_follow_years() {
        let range = DateRange::new(d(2019, 7, 1), d(2021, 12, 31)).unwrap();
        let parts = split_range(range, 12);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1].start, d(2020, 1, 1));
        assert_eq!(parts[1].end, d(2020, 12, 31));
        assert_partition(range, &parts);
    }
}
