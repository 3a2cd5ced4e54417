//! Log-density tone mapping from histogram bins to 16-bit colors.

use image::{ImageBuffer, Rgba};

use crate::Hist;

/// `log10(0xffff)`: colors are accumulated at 16-bit scale.
const COLOR_RANGE: f64 = 4.816_473_303_765_25;
/// `log10(200)`: a density of 200 hits per unit maps to white.
const WHITE_POINT: f64 = 2.301_029_995_663_981;

/// Tone mapping parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToneMap {
    /// Multiplier on log density.
    pub brightness: f64,
    pub gamma: f64,
    /// Densities below this are blended towards linear to avoid the steep
    /// low end of the gamma curve.
    pub gamma_min: f64,
}
impl Default for ToneMap {
    fn default() -> Self {
        Self {
            brightness: 1.,
            gamma: 1.,
            gamma_min: 0.,
        }
    }
}

/// ACES filmic curve.
#[must_use]
#[inline]
pub fn aces(x: f64) -> f64 {
    const A: f64 = 2.51;
    const B: f64 = 0.03;
    const C: f64 = 2.43;
    const D: f64 = 0.59;
    const E: f64 = 0.14;
    x * (A * x + B) / (x * (C * x + D) + E)
}

/// `a^exp`, blended below `tr` with the line through the origin that meets
/// the curve at `tr`.
#[must_use]
#[inline]
pub fn gamma(a: f64, exp: f64, tr: f64) -> f64 {
    if a >= tr {
        return a.powf(exp);
    }
    let p = a / tr;
    p * a.powf(exp) + (1. - p) * a * tr.powf(exp - 1.)
}

/// Scale a color in `[0, 1]` to 16 bits, saturating. NaN maps to 0.
#[inline]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn cscale(x: f64) -> u16 {
    (x * 65536.).clamp(0., 65535.) as u16
}

/// A tone-mapped view of a [`Hist`]. Pixels are computed on access.
///
/// The view reads bins with relaxed loads, so it may be taken while workers
/// are plotting. Such a view can mix bins from slightly different moments.
#[derive(Debug, Clone, Copy)]
pub struct HistImage<'a> {
    hist: &'a Hist,
    /// Constant part of the log density.
    lqa: f64,
    brightness: f64,
    exp: f64,
    tr: f64,
}
impl<'a> HistImage<'a> {
    /// `area` is the area of the plane visible in the histogram and `iters`
    /// the number of iterations plotted so far. Non-positive areas are treated
    /// as 1 and zero iterations as one.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn new(hist: &'a Hist, tm: &ToneMap, area: f64, iters: u64) -> Self {
        let area = if area > 0. && area.is_finite() { area } else { 1. };
        let lqa = WHITE_POINT - COLOR_RANGE + 4. * (hist.osa().max(1) as f64).log10()
            - area.log10()
            + (hist.len().max(1) as f64).log10()
            - (iters.max(1) as f64).log10();
        Self {
            hist,
            lqa,
            brightness: tm.brightness,
            exp: tm.gamma.recip(),
            tr: tm.gamma_min,
        }
    }

    /// Width and height in bins.
    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        (
            u32::try_from(self.hist.cols()).unwrap_or(u32::MAX),
            u32::try_from(self.hist.rows()).unwrap_or(u32::MAX),
        )
    }

    /// The color at a bin. Transparent outside the histogram.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn at(&self, x: u32, y: u32) -> Rgba<u16> {
        let Some(bin) = self.hist.bin(x as usize, y as usize) else {
            return Rgba([0; 4]);
        };
        let [r, g, b, n] = bin.load();
        if n == 0 {
            return Rgba([0; 4]);
        }
        let n = n as f64;
        let a = self.brightness * (n.log10() + self.lqa);
        // the filmic curve rises again below zero
        if a <= 0. || a.is_nan() {
            return Rgba([0; 4]);
        }
        let alpha = cscale(gamma(aces(a), self.exp, self.tr));
        if alpha == 0 {
            return Rgba([0; 4]);
        }
        let s = a / n;
        Rgba([
            cscale(s * r as f64),
            cscale(s * g as f64),
            cscale(s * b as f64),
            alpha,
        ])
    }

    /// Tone-map every bin.
    #[must_use]
    pub fn to_buffer(&self) -> ImageBuffer<Rgba<u16>, Vec<u16>> {
        let (w, h) = self.dimensions();
        ImageBuffer::from_fn(w, h, |x, y| self.at(x, y))
    }
}

impl Hist {
    /// A tone-mapped view of this histogram. See [`HistImage::new`].
    #[must_use]
    pub fn image(&self, tm: &ToneMap, area: f64, iters: u64) -> HistImage<'_> {
        HistImage::new(self, tm, area, iters)
    }
}
