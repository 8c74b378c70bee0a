//! Windowing engine.
//!
//! Slides a lookback window of `L` bars across one symbol's series and emits one
//! sample per valid as-of date inside the requested range. A window is valid when:
//!
//! - `L` bars exist ending exactly at the as-of date
//! - no gap between consecutive bars exceeds `max_gap_days` calendar days
//! - the renderer accepts it (no NaN fields, defined indicators, non-flat range)
//! - in training mode, `horizon` further bars exist to compute the label
//!
//! Invalid windows are dropped and tallied; they never fail the symbol.

use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate};
use tracing::trace;

use crate::config::DatasetConfig;
use crate::domain::{DateRange, Indicator, Mode, PriceBar, Sample, Window};
use crate::error::DataQualityError;
use crate::render::{RenderOptions, render};

/// Per-symbol accounting of what happened to candidate windows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowStats {
    /// As-of dates in range (after striding) with at least `L` bars of history.
    pub candidates: usize,
    /// In-range as-of dates skipped because fewer than `L` bars precede them.
    pub short_history: usize,
    /// Training mode only: windows dropped for lack of future bars.
    pub missing_label: usize,
    pub kept: usize,
    pub rejected: BTreeMap<&'static str, usize>,
}

impl WindowStats {
    pub fn merge(&mut self, other: &WindowStats) {
        self.candidates += other.candidates;
        self.short_history += other.short_history;
        self.missing_label += other.missing_label;
        self.kept += other.kept;
        for (reason, n) in &other.rejected {
            *self.rejected.entry(reason).or_default() += n;
        }
    }

    pub fn rejected_total(&self) -> usize {
        self.rejected.values().sum()
    }

    fn reject(&mut self, err: &DataQualityError) {
        *self.rejected.entry(err.reason()).or_default() += 1;
    }
}

/// Build all samples for one symbol.
///
/// `bars` must be chronological and may start before `range.start` (history for
/// the lookback and indicators) and end after `range.end` (future bars for labels).
pub fn symbol_samples(
    bars: &[PriceBar],
    range: DateRange,
    config: &DatasetConfig,
    mode: Mode,
) -> (Vec<Sample>, WindowStats) {
    let lookback = config.profile.days();
    let mut stats = WindowStats::default();
    let mut samples = Vec::new();

    let overlays: Vec<Vec<f64>> = config
        .indicators
        .iter()
        .map(|ind| indicator_series(bars, *ind))
        .collect();
    let opts = RenderOptions {
        profile: config.profile,
        show_volume: config.show_volume,
    };

    let in_range: Vec<usize> = bars
        .iter()
        .enumerate()
        .filter(|(_, b)| range.contains(b.date) && on_stride(b.date, config.sample_rate))
        .map(|(idx, _)| idx)
        .collect();

    for end in in_range {
        if end + 1 < lookback {
            stats.short_history += 1;
            continue;
        }
        stats.candidates += 1;
        let start = end + 1 - lookback;
        let window_bars = &bars[start..=end];

        if let Err(err) = check_gaps(window_bars, config.max_gap_days) {
            trace!(date = %bars[end].date, "window rejected: {err}");
            stats.reject(&err);
            continue;
        }

        let label = match mode {
            Mode::Inference => None,
            Mode::Train => match forward_label(bars, end, config.label.days(), config.max_gap_days) {
                Some(label) => Some(label),
                None => {
                    stats.missing_label += 1;
                    continue;
                }
            },
        };

        let window = Window {
            bars: window_bars,
            overlays: overlays.iter().map(|o| &o[start..=end]).collect(),
        };
        match render(&window, &opts) {
            Ok(image) => {
                stats.kept += 1;
                samples.push(Sample {
                    image,
                    date: bars[end].date,
                    label,
                });
            }
            Err(err) => {
                trace!(date = %bars[end].date, "window rejected: {err}");
                stats.reject(&err);
            }
        }
    }

    (samples, stats)
}

/// Whether `date` survives a stride of `rate`.
///
/// The stride is anchored on the calendar (day number since 0001-01-01), not on
/// the first bar of the request, so splitting a range never shifts the kept dates.
pub fn on_stride(date: NaiveDate, rate: usize) -> bool {
    let rate = rate.max(1) as i64;
    i64::from(date.num_days_from_ce()).rem_euclid(rate) == 0
}

/// Reject windows with a calendar gap longer than the normal non-trading pattern.
pub fn check_gaps(bars: &[PriceBar], max_gap_days: i64) -> Result<(), DataQualityError> {
    for pair in bars.windows(2) {
        let days = (pair[1].date - pair[0].date).num_days();
        if days > max_gap_days {
            return Err(DataQualityError::CalendarGap {
                date: pair[1].date,
                days,
            });
        }
    }
    Ok(())
}

/// 1 if the close `horizon` bars after `end` is above the close at `end`, else 0.
///
/// `None` when the future bars are missing, gapped, or carry a NaN close.
pub fn forward_label(bars: &[PriceBar], end: usize, horizon: usize, max_gap_days: i64) -> Option<u8> {
    let target = end.checked_add(horizon)?;
    if target >= bars.len() || horizon == 0 {
        return None;
    }
    check_gaps(&bars[end..=target], max_gap_days).ok()?;

    let now = bars[end].close;
    let later = bars[target].close;
    if !(now.is_finite() && later.is_finite()) || now <= 0.0 {
        return None;
    }
    Some(u8::from(later / now - 1.0 > 0.0))
}

/// Indicator values aligned with `bars`; `NaN` where undefined.
pub fn indicator_series(bars: &[PriceBar], indicator: Indicator) -> Vec<f64> {
    match indicator {
        Indicator::MovingAverage { period } => {
            let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
            moving_average(&closes, period)
        }
    }
}

/// Trailing simple moving average (window includes the current value).
pub fn moving_average(values: &[f64], period: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    if period == 0 {
        return out;
    }
    for end in (period - 1)..values.len() {
        let slice = &values[end + 1 - period..=end];
        if slice.iter().all(|v| v.is_finite()) {
            out[end] = slice.iter().sum::<f64>() / period as f64;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_MAX_GAP_DAYS;
    use crate::domain::{LabelHorizon, LookbackProfile};
    use crate::inference::split_range;
    use chrono::Duration;

    fn config(profile: LookbackProfile) -> DatasetConfig {
        DatasetConfig {
            profile,
            indicators: vec![],
            show_volume: false,
            parallel_num: 1,
            fraction: 1.0,
            seed: 42,
            symbols: None,
            sample_rate: 1,
            max_gap_days: DEFAULT_MAX_GAP_DAYS,
            label: LabelHorizon::Ret5,
        }
    }

    /// Consecutive calendar days starting 2024-01-01 with a rising, wiggling price.
    fn series(n: usize) -> Vec<PriceBar> {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        (0..n)
            .map(|i| {
                let base = 20.0 + i as f64 + if i % 2 == 0 { 0.3 } else { -0.3 };
                PriceBar {
                    date: start + Duration::days(i as i64),
                    open: base,
                    high: base + 1.0,
                    low: base - 1.0,
                    close: base + 0.2,
                    volume: 100.0 + i as f64,
                }
            })
            .collect()
    }

    fn range(from: u32, to: u32) -> DateRange {
        DateRange::new(
            NaiveDate::from_ymd_opt(2024, 1, from).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, to).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn fewer_bars_than_lookback_yields_nothing() {
        let bars = series(4);
        let (samples, stats) =
            symbol_samples(&bars, range(1, 31), &config(LookbackProfile::FiveDay), Mode::Inference);
        assert!(samples.is_empty());
        assert_eq!(stats.candidates, 0);
        assert_eq!(stats.short_history, 4);
    }

    #[test]
    fn exactly_lookback_bars_yields_one_window() {
        let bars = series(5);
        let (samples, stats) =
            symbol_samples(&bars, range(1, 31), &config(LookbackProfile::FiveDay), Mode::Inference);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].date, NaiveDate::from_ymd_opt(2024, 1, 5).unwrap());
        assert_eq!(samples[0].image.shape(), (32, 15));
        assert_eq!(samples[0].label, None);
        assert_eq!(stats.kept, 1);
    }

    #[test]
    fn history_before_range_is_used() {
        let bars = series(12);
        let (samples, _) =
            symbol_samples(&bars, range(10, 12), &config(LookbackProfile::FiveDay), Mode::Inference);
        let days: Vec<NaiveDate> = samples.iter().map(|s| s.date).collect();
        assert_eq!(days.len(), 3);
        assert_eq!(days[0], NaiveDate::from_ymd_opt(2024, 1, 10).unwrap());
        assert!(days.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn training_mode_drops_windows_without_future() {
        let bars = series(12);
        let cfg = config(LookbackProfile::FiveDay);
        let (inference, _) = symbol_samples(&bars, range(1, 31), &cfg, Mode::Inference);
        let (train, stats) = symbol_samples(&bars, range(1, 31), &cfg, Mode::Train);
        // Inference keeps as-of 5..=12; training needs 5 more bars after as-of.
        assert_eq!(inference.len(), 8);
        assert_eq!(train.len(), 3);
        assert_eq!(stats.missing_label, 5);
        assert!(train.iter().all(|s| s.label == Some(1)));
    }

    #[test]
    fn calendar_gap_rejects_spanning_windows() {
        let mut bars = series(10);
        for bar in bars.iter_mut().skip(5) {
            bar.date += Duration::days(30);
        }
        let full = DateRange::new(bars[0].date, bars[9].date).unwrap();
        let (samples, stats) =
            symbol_samples(&bars, full, &config(LookbackProfile::FiveDay), Mode::Inference);
        // Only the window fully before the gap and the one fully after survive.
        assert_eq!(samples.len(), 2);
        assert_eq!(stats.rejected.get("calendar_gap"), Some(&4));
    }

    #[test]
    fn nan_bar_drops_only_touching_windows() {
        let mut bars = series(10);
        bars[2].volume = f64::NAN;
        let (samples, stats) =
            symbol_samples(&bars, range(1, 31), &config(LookbackProfile::FiveDay), Mode::Inference);
        // Windows ending at index 4..=6 include index 2.
        assert_eq!(samples.len(), 3);
        assert_eq!(stats.rejected.get("missing_value"), Some(&3));
    }

    #[test]
    fn moving_average_needs_warmup() {
        let ma = moving_average(&[1.0, 2.0, 3.0, 4.0], 3);
        assert!(ma[0].is_nan() && ma[1].is_nan());
        assert_eq!(ma[2], 2.0);
        assert_eq!(ma[3], 3.0);
    }

    #[test]
    fn indicator_warmup_rejects_early_windows() {
        let bars = series(9);
        let mut cfg = config(LookbackProfile::FiveDay);
        cfg.indicators = vec![Indicator::MovingAverage { period: 5 }];
        let (samples, stats) = symbol_samples(&bars, range(1, 31), &cfg, Mode::Inference);
        // First fully-defined MA window ends at index 8 (needs 4 extra bars).
        assert_eq!(samples.len(), 1);
        assert_eq!(stats.rejected.get("indicator_undefined"), Some(&4));
    }

    #[test]
    fn sample_rate_strides_as_of_dates() {
        let bars = series(12);
        let mut cfg = config(LookbackProfile::FiveDay);
        cfg.sample_rate = 3;
        let (samples, _) = symbol_samples(&bars, range(5, 12), &cfg, Mode::Inference);
        let days: Vec<u32> = samples.iter().map(|s| s.date.day()).collect();
        // 2024-01-03 is day 738888 since CE, a multiple of 3.
        assert_eq!(days, vec![6, 9, 12]);
    }

    #[test]
    fn stride_does_not_depend_on_sub_range_split() {
        let bars = series(120);
        let mut cfg = config(LookbackProfile::FiveDay);
        cfg.sample_rate = 7;
        let whole = DateRange::new(
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 4, 29).unwrap(),
        )
        .unwrap();

        let dates = |r: DateRange| -> Vec<NaiveDate> {
            symbol_samples(&bars, r, &cfg, Mode::Inference)
                .0
                .iter()
                .map(|s| s.date)
                .collect()
        };
        let once = dates(whole);
        let pieces = split_range(whole, 3);
        assert_eq!(pieces.len(), 2);
        let split: Vec<NaiveDate> = pieces.into_iter().flat_map(dates).collect();

        assert_eq!(once.len(), 9);
        assert!(once.windows(2).all(|w| (w[1] - w[0]).num_days() == 7));
        assert_eq!(once, split);
    }

    /// Business days from Feb 1 to Mar 29 2024 with the exchange closed Feb 9 to 18.
    fn lunar_new_year_2024() -> Vec<PriceBar> {
        let mut day = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 3, 29).unwrap();
        let closed = (
            NaiveDate::from_ymd_opt(2024, 2, 9).unwrap(),
            NaiveDate::from_ymd_opt(2024, 2, 18).unwrap(),
        );
        let mut bars = Vec::new();
        while day <= end {
            let weekend = day.weekday().number_from_monday() > 5;
            if !weekend && !(closed.0 <= day && day <= closed.1) {
                let i = bars.len() as f64;
                let base = 8.0 + 0.1 * i + if bars.len() % 3 == 0 { 0.25 } else { 0.0 };
                bars.push(PriceBar {
                    date: day,
                    open: base,
                    high: base + 0.4,
                    low: base - 0.4,
                    close: base + 0.1,
                    volume: 1_000.0 + i,
                });
            }
            day += Duration::days(1);
        }
        bars
    }

    #[test]
    fn holiday_closure_is_a_normal_gap() {
        let bars = lunar_new_year_2024();
        assert_eq!(bars.len(), 36);
        let full = DateRange::new(bars[0].date, bars[35].date).unwrap();

        let cfg = config(LookbackProfile::TwentyDay);
        let (samples, stats) = symbol_samples(&bars, full, &cfg, Mode::Inference);
        assert_eq!(stats.candidates, 17);
        assert_eq!(stats.kept, 17);
        assert_eq!(stats.rejected_total(), 0);
        assert_eq!(samples.len(), 17);

        let mut strict = cfg.clone();
        strict.max_gap_days = 10;
        let (_, stats) = symbol_samples(&bars, full, &strict, Mode::Inference);
        assert!(stats.rejected.get("calendar_gap").is_some_and(|&n| n > 0));
    }

    #[test]
    fn forward_label_sign() {
        let mut bars = series(8);
        assert_eq!(forward_label(&bars, 2, 5, 10), Some(1));
        bars[7].close = 1.0;
        assert_eq!(forward_label(&bars, 2, 5, 10), Some(0));
        assert_eq!(forward_label(&bars, 3, 5, 10), None);
    }
}
