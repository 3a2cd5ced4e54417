//! The chaos game, run by one worker.

use crate::rng::ChaosRng;
use crate::system::{System, SystemError};
use crate::Point;

/// Number of iterations to discard before trusting a trajectory.
pub const FUSE_LEN: usize = 30;

/// 2<sup>53</sup>, the fixed-point scale for weights and opacities. Scaling
/// to the mantissa width keeps the `f64` to integer conversion exact.
const SCALE: u64 = 1 << 53;

/// Sum with Kahan compensation.
fn kahan_sum(v: &[f64]) -> f64 {
    let (mut sum, mut c) = (0., 0.);
    for x in v {
        let y = x - c;
        let t = sum + y;
        c = (t - sum) - y;
        sum = t;
    }
    sum
}

/// Per-source cumulative tables over the 53-bit domain.
///
/// Every node with a positive effective weight owns a range at least one unit
/// wide, so it stays reachable however small its weight is. Each row's total
/// is at most 2<sup>53</sup>; variates falling in the residual above the
/// total are redrawn.
#[derive(Debug, Clone)]
pub(crate) struct SelectionTable {
    n: usize,
    cum: Vec<u64>,
}
impl SelectionTable {
    pub(crate) fn new(system: &System) -> Self {
        let n = system.nodes.len();
        let mut cum = vec![0; n * n];
        let mut wb = vec![0.; n];
        for from in 0..n {
            for (to, w) in wb.iter_mut().enumerate() {
                *w = system.effective_weight(from, to);
            }
            let sum = kahan_sum(&wb);
            let row = &mut cum[from * n..(from + 1) * n];
            if sum <= 0. {
                // Only reachable for a lone node, which is never a choice.
                row.fill(SCALE);
                continue;
            }
            Self::fill_row(row, &wb, sum);
        }
        Self { n, cum }
    }

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn fill_row(row: &mut [u64], weights: &[f64], sum: f64) {
        let mut widths: Vec<u64> = weights
            .iter()
            .map(|&w| {
                let width = (w / sum * SCALE as f64) as u64;
                if w > 0. && width == 0 {
                    1
                } else {
                    width
                }
            })
            .collect();
        let total: u64 = widths.iter().sum();
        if total > SCALE {
            // Bumping tiny weights can overshoot; the largest range pays.
            if let Some(max) = widths.iter_mut().max() {
                *max -= total - SCALE;
            }
        }
        let mut acc = 0;
        for (c, w) in row.iter_mut().zip(widths) {
            acc += w;
            *c = acc;
        }
    }

    pub(crate) fn row(&self, from: usize) -> &[u64] {
        &self.cum[from * self.n..(from + 1) * self.n]
    }

    /// Choose the node following `from`.
    #[inline]
    pub(crate) fn next(&self, from: usize, rng: &mut ChaosRng) -> usize {
        if self.n == 1 {
            return 0;
        }
        let row = self.row(from);
        let total = row[self.n - 1];
        loop {
            let v = rng.uint53();
            if v < total {
                return row.partition_point(|&c| c <= v);
            }
        }
    }
}

/// The iterator for a single worker thread.
///
/// Owns its randomness stream and its selection tables, so no
/// synchronization is needed while stepping.
pub struct ChaosIter<'a> {
    system: &'a System,
    table: SelectionTable,
    /// Opacities in the 53-bit domain.
    opacity: Vec<u64>,
    rng: ChaosRng,
    p: Point,
    k: usize,
}
impl<'a> ChaosIter<'a> {
    /// Build the selection tables for `system` and fuse.
    ///
    /// # Errors
    ///
    /// Returns the error from [`System::check`].
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn new(system: &'a System, rng: ChaosRng) -> Result<Self, SystemError> {
        system.check()?;
        let table = SelectionTable::new(system);
        let opacity = system
            .nodes
            .iter()
            .map(|n| (n.opacity * SCALE as f64) as u64)
            .collect();
        let mut it = Self {
            system,
            table,
            opacity,
            rng,
            p: Point::default(),
            k: 0,
        };
        it.fuse();
        Ok(it)
    }

    /// Start a new trajectory from a random point in \[-1, 1\]³ × \[0, 1\].
    ///
    /// The warm-up stops early if the point becomes invalid; the next
    /// [`Self::step`] then refuses again.
    pub fn fuse(&mut self) {
        let rng = &mut self.rng;
        let mut p = Point {
            x: rng.uniform_range(-1., 1.),
            y: rng.uniform_range(-1., 1.),
            z: rng.uniform_range(-1., 1.),
            c: rng.uniform(),
        };
        let mut k = self.table.next(rng.intn(self.table.n), rng);
        for _ in 0..FUSE_LEN {
            p = self.system.nodes[k].func.calc(p, rng);
            if !p.is_valid() {
                break;
            }
            k = self.table.next(k, rng);
        }
        self.p = p;
        self.k = k;
    }

    /// Apply one function and select the next node.
    ///
    /// Returns the point to plot, with the final function applied, or `None`
    /// if the node's opacity rejected it or the trajectory diverged (in which
    /// case the iterator has re-fused).
    #[inline]
    pub fn step(&mut self) -> Option<Point> {
        let k = self.k;
        self.p = self.system.nodes[k].func.calc(self.p, &mut self.rng);
        if !self.p.is_valid() {
            self.fuse();
            return None;
        }
        let op = self.opacity[k];
        let out = if op >= SCALE || (op > 0 && self.rng.uint53() < op) {
            let fp = match &self.system.final_func {
                Some(f) => f.calc(self.p, &mut self.rng),
                None => self.p,
            };
            if !fp.is_valid() {
                self.fuse();
                return None;
            }
            Some(fp)
        } else {
            None
        };
        self.k = self.table.next(k, &mut self.rng);
        out
    }

    /// The current point of the trajectory (before the final function).
    #[must_use]
    pub fn point(&self) -> Point {
        self.p
    }
    /// The node which the next step applies.
    #[must_use]
    pub fn node(&self) -> usize {
        self.k
    }
}
