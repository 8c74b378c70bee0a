//! Bar renderer: turns one price window into a fixed-size pixel grid.
//!
//! Layout (per trading day `i`, three columns):
//!
//! ```text
//!   col 3i     open tick
//!   col 3i+1   high-low bar (and the volume bar below the price area)
//!   col 3i+2   close tick
//! ```
//!
//! Prices (and indicator overlays) are min-max scaled within the window only, so
//! two windows with the same shape at different price levels render identically.
//! Rendering is a pure function; invalid windows are rejected with a
//! [`DataQualityError`] instead of producing a degenerate image.

use crate::domain::{Image, LookbackProfile, Window};
use crate::error::DataQualityError;

pub mod ascii;

pub use ascii::render_ascii;

/// Pixel value for a lit cell.
pub const INK: u8 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderOptions {
    pub profile: LookbackProfile,
    pub show_volume: bool,
}

/// Render `window` into an image of the profile's fixed shape.
pub fn render(window: &Window<'_>, opts: &RenderOptions) -> Result<Image, DataQualityError> {
    let profile = opts.profile;
    let days = profile.days();
    if window.bars.len() != days {
        return Err(DataQualityError::ShapeMismatch {
            expected: days,
            got: window.bars.len(),
        });
    }
    if let Some(bad) = window.overlays.iter().find(|o| o.len() != days) {
        return Err(DataQualityError::ShapeMismatch {
            expected: days,
            got: bad.len(),
        });
    }

    validate_bars(window, profile)?;

    let (min, max) = price_bounds(window);
    let span = max - min;
    if !(span.is_finite() && span > 0.0) {
        return Err(DataQualityError::FlatRange);
    }

    let height = profile.image_height();
    let mut image = Image::blank(height, profile.image_width());
    let (levels, offset) = profile.price_levels(opts.show_volume);
    let price_row = |v: f64| -> usize {
        let level = scale(v, min, span, levels) + offset;
        height - 1 - level
    };

    for (i, bar) in window.bars.iter().enumerate() {
        let col = 3 * i;
        image.set(price_row(bar.open), col, INK);

        let (top, bottom) = {
            let a = price_row(bar.high);
            let b = price_row(bar.low);
            (a.min(b), a.max(b))
        };
        for row in top..=bottom {
            image.set(row, col + 1, INK);
        }

        image.set(price_row(bar.close), col + 2, INK);

        for overlay in &window.overlays {
            let row = price_row(overlay[i]);
            image.set(row, col, INK);
            image.set(row, col + 1, INK);
        }
    }

    if opts.show_volume {
        draw_volume(&mut image, window, profile);
    }

    Ok(image)
}

fn validate_bars(window: &Window<'_>, profile: LookbackProfile) -> Result<(), DataQualityError> {
    for (i, bar) in window.bars.iter().enumerate() {
        if !bar.is_complete() {
            return Err(DataQualityError::MissingValue(bar.date));
        }
        if [bar.open, bar.high, bar.low, bar.close].iter().any(|&p| p <= 0.0) {
            return Err(DataQualityError::NonPositivePrice(bar.date));
        }
        if bar.volume < 0.0 {
            return Err(DataQualityError::NegativeVolume(bar.date));
        }
        if window.overlays.iter().any(|o| !o[i].is_finite()) {
            return Err(DataQualityError::IndicatorUndefined(bar.date));
        }
    }

    let flat = window.bars.iter().filter(|b| b.is_flat()).count();
    let limit = profile.max_flat_days();
    if flat > limit {
        return Err(DataQualityError::TooManyFlatDays { flat, limit });
    }
    Ok(())
}

fn price_bounds(window: &Window<'_>) -> (f64, f64) {
    let prices = window
        .bars
        .iter()
        .flat_map(|b| [b.open, b.high, b.low, b.close])
        .chain(window.overlays.iter().flat_map(|o| o.iter().copied()));

    prices.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    })
}

/// Map `v` to an integer level in `0..levels` (truncating).
fn scale(v: f64, min: f64, span: f64, levels: usize) -> usize {
    let unit = ((v - min) / span).clamp(0.0, 1.0);
    ((unit * (levels - 1) as f64) as usize).min(levels - 1)
}

fn draw_volume(image: &mut Image, window: &Window<'_>, profile: LookbackProfile) {
    let (vmin, vmax) = window
        .bars
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), b| {
            (lo.min(b.volume), hi.max(b.volume))
        });
    let span = vmax - vmin;
    // Constant volume carries no shape information; leave the area blank.
    if !(span.is_finite() && span > 0.0) {
        return;
    }

    let height = image.height();
    let levels = profile.volume_levels();
    for (i, bar) in window.bars.iter().enumerate() {
        // 0..=levels rows: the window's largest volume fills the whole area.
        let filled = scale(bar.volume, vmin, span, levels + 1);
        for k in 0..filled {
            image.set(height - 1 - k, 3 * i + 1, INK);
        }
    }
}
