//! The oversampled histogram which workers plot onto.

use std::io::{self, Read, Write};
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};

use image::Rgba;

/// Output size and oversampling of a histogram.
///
/// The histogram has `w * osa` columns and `h * osa` rows. Any zero field
/// describes an empty histogram.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy, Hash)]
pub struct Size {
    pub w: usize,
    pub h: usize,
    /// Bins per output pixel along each axis.
    pub osa: usize,
}
impl Size {
    #[must_use]
    pub const fn new(w: usize, h: usize, osa: usize) -> Self {
        Self { w, h, osa }
    }
    #[must_use]
    pub fn is_empty(self) -> bool {
        self.w == 0 || self.h == 0 || self.osa == 0
    }
    /// Number of bins, or `None` if the bins would not fit in memory.
    #[must_use]
    pub fn bins(self) -> Option<usize> {
        let n = self
            .w
            .checked_mul(self.h)?
            .checked_mul(self.osa)?
            .checked_mul(self.osa)?;
        let bytes = n.checked_mul(mem::size_of::<Bin>())?;
        // allocations are limited to isize::MAX bytes
        isize::try_from(bytes).ok().map(|_| n)
    }
    /// Estimated memory usage in bytes, or `None` if it overflows.
    #[must_use]
    pub fn mem(self) -> Option<usize> {
        Hist::mem_for(self)
    }
}
impl std::fmt::Display for Size {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}:{}", self.w, self.h, self.osa)
    }
}

/// One histogram cell. Every channel is accumulated independently.
#[derive(Debug, Default)]
pub struct Bin {
    r: AtomicU64,
    g: AtomicU64,
    b: AtomicU64,
    /// Hit count, accumulated from the alpha channel of plotted colors.
    n: AtomicU64,
}
impl Bin {
    /// Red, green, blue and count.
    #[must_use]
    #[inline]
    pub fn load(&self) -> [u64; 4] {
        [
            self.r.load(Ordering::Relaxed),
            self.g.load(Ordering::Relaxed),
            self.b.load(Ordering::Relaxed),
            self.n.load(Ordering::Relaxed),
        ]
    }
    fn channels_mut(&mut self) -> [&mut u64; 4] {
        [
            self.r.get_mut(),
            self.g.get_mut(),
            self.b.get_mut(),
            self.n.get_mut(),
        ]
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HistError {
    #[error("histogram size {0} overflows addressable memory")]
    Overflow(Size),
    #[error("malformed histogram dump: {0}")]
    Format(&'static str),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A uniform two-dimensional histogram.
///
/// [`Hist::add`] takes `&self` and may be called from any number of threads.
/// Everything that changes the structure, or needs a consistent view of every
/// bin, takes `&mut self`, so it cannot overlap with plotting.
///
/// Bounds are checked on every access, in all build profiles.
#[derive(Debug, Default)]
pub struct Hist {
    bins: Vec<Bin>,
    cols: usize,
    rows: usize,
    osa: usize,
}
impl Hist {
    /// Allocate a histogram.
    ///
    /// # Errors
    ///
    /// Returns [`HistError::Overflow`] if the bins would not fit in memory.
    pub fn new(size: Size) -> Result<Self, HistError> {
        let mut h = Self::default();
        h.reset(size)?;
        Ok(h)
    }

    /// Estimated memory usage in bytes of a histogram of `size`.
    #[must_use]
    pub fn mem_for(size: Size) -> Option<usize> {
        size.bins()?
            .checked_mul(mem::size_of::<Bin>())?
            .checked_add(mem::size_of::<Self>())
    }

    /// Clear all bins. If the number of bins changes, the old bins are freed
    /// before the new ones are allocated; otherwise the bins are zeroed in
    /// place.
    ///
    /// # Errors
    ///
    /// Returns [`HistError::Overflow`] without touching the histogram if the
    /// new size would not fit in memory.
    pub fn reset(&mut self, size: Size) -> Result<(), HistError> {
        let n = if size.is_empty() {
            0
        } else {
            size.bins().ok_or(HistError::Overflow(size))?
        };
        if n == self.bins.len() {
            for bin in &mut self.bins {
                bin.channels_mut().into_iter().for_each(|c| *c = 0);
            }
        } else {
            // Histograms can be huge. Free before allocating.
            self.bins = Vec::new();
            self.bins = std::iter::repeat_with(Bin::default).take(n).collect();
            log::info!(
                "allocated {size} histogram: {n} bins, {} MiB",
                Self::mem_for(size).unwrap_or(0) >> 20
            );
        }
        if n == 0 {
            (self.cols, self.rows, self.osa) = (0, 0, size.osa);
        } else {
            (self.cols, self.rows, self.osa) = (size.w * size.osa, size.h * size.osa, size.osa);
        }
        Ok(())
    }

    #[inline]
    fn index(&self, col: usize, row: usize) -> usize {
        assert!(
            col < self.cols && row < self.rows,
            "histogram position ({col}, {row}) out of bounds ({}x{})",
            self.cols,
            self.rows
        );
        row * self.cols + col
    }

    /// Accumulate a color into a bin.
    ///
    /// # Panics
    ///
    /// Panics if the position is out of bounds. Plotting validates positions,
    /// so this indicates a bug in the projection.
    #[inline]
    pub fn add(&self, col: usize, row: usize, c: Rgba<u16>) {
        let bin = &self.bins[self.index(col, row)];
        let [r, g, b, a] = c.0;
        bin.r.fetch_add(u64::from(r), Ordering::Relaxed);
        bin.g.fetch_add(u64::from(g), Ordering::Relaxed);
        bin.b.fetch_add(u64::from(b), Ordering::Relaxed);
        bin.n.fetch_add(u64::from(a), Ordering::Relaxed);
    }

    /// The bin at a position, or `None` out of bounds.
    #[must_use]
    #[inline]
    pub fn bin(&self, col: usize, row: usize) -> Option<&Bin> {
        if col < self.cols && row < self.rows {
            Some(&self.bins[row * self.cols + col])
        } else {
            None
        }
    }

    #[must_use]
    pub fn cols(&self) -> usize {
        self.cols
    }
    #[must_use]
    pub fn rows(&self) -> usize {
        self.rows
    }
    #[must_use]
    pub fn osa(&self) -> usize {
        self.osa
    }
    /// Number of bins.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bins.len()
    }
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }
    /// Columns over rows, or 0 if empty.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn aspect(&self) -> f64 {
        if self.is_empty() {
            0.
        } else {
            self.cols as f64 / self.rows as f64
        }
    }

    /// Dump the bins: columns and rows, then every red count in row-major
    /// order, then green, blue and hit counts. Every value is a little-endian
    /// `u64`. Returns the number of bytes written.
    ///
    /// `writer` is written to in 8-byte pieces; wrap it in a
    /// [`std::io::BufWriter`] if that matters.
    ///
    /// # Errors
    ///
    /// Passes on errors from `writer`.
    pub fn write_to(&mut self, mut writer: impl Write) -> io::Result<u64> {
        writer.write_all(&(self.cols as u64).to_le_bytes())?;
        writer.write_all(&(self.rows as u64).to_le_bytes())?;
        for channel in 0..4 {
            for bin in &mut self.bins {
                writer.write_all(&bin.channels_mut()[channel].to_le_bytes())?;
            }
        }
        Ok(16 + 32 * self.bins.len() as u64)
    }

    /// Load a dump written by [`Hist::write_to`]. `osa` is the oversampling
    /// the histogram was rendered with, which the dump does not record.
    ///
    /// # Errors
    ///
    /// Returns [`HistError::Format`] if the dimensions are not multiples of
    /// `osa`, [`HistError::Overflow`] if they are too large, and
    /// [`HistError::Io`] if `reader` fails or ends early.
    pub fn read_from(mut reader: impl Read, osa: usize) -> Result<Self, HistError> {
        let mut word = [0; 8];
        let mut next = |reader: &mut dyn Read| -> io::Result<u64> {
            reader.read_exact(&mut word)?;
            Ok(u64::from_le_bytes(word))
        };
        let cols = usize::try_from(next(&mut reader)?).map_err(|_| HistError::Format("columns"))?;
        let rows = usize::try_from(next(&mut reader)?).map_err(|_| HistError::Format("rows"))?;
        if osa == 0 || cols % osa != 0 || rows % osa != 0 {
            return Err(HistError::Format("size is not a multiple of oversampling"));
        }
        let mut h = Self::new(Size::new(cols / osa, rows / osa, osa))?;
        for channel in 0..4 {
            for bin in &mut h.bins {
                *bin.channels_mut()[channel] = next(&mut reader)?;
            }
        }
        Ok(h)
    }

    #[cfg(test)]
    pub(crate) fn as_ptr(&self) -> *const Bin {
        self.bins.as_ptr()
    }
}
