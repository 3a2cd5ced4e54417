#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Fractal flame renderer.
//!
//! A fractal flame is the attractor of an iterated function system: a set of
//! functions is applied to a running point, one at a time, chosen at random
//! from a weighted directed graph (the *chaos game*). Every resulting point is
//! projected through a camera onto an oversampled histogram, and the
//! histogram is later tone-mapped from log density to 16-bit colors.
//!
//! [`Render`] owns the histogram and drives a pool of worker threads, each
//! with its own [`ChaosIter`] and non-overlapping [`ChaosRng`] stream. It can
//! run to an iteration or hit cap with [`Render::render`], or live with
//! [`Render::render_async`], which accepts reconfiguration and snapshot
//! requests while the workers keep accumulating.
//!
//! The functions themselves are opaque: anything implementing [`Func`] can be
//! placed in a [`System`].

pub mod affine;
pub mod config;
pub mod context;
pub mod hist;
pub mod iterator;
pub mod render;
pub mod rng;
pub mod system;
pub mod tonemap;
pub mod variations;

pub use affine::Affine;
pub use context::{CancelToken, Context};
pub use hist::{Hist, HistError, Size};
pub use iterator::ChaosIter;
pub use render::{ChangeRender, Frame, PlotRequest, Progress, Render, RenderError};
pub use rng::ChaosRng;
pub use system::{Node, System, SystemError};
pub use tonemap::{HistImage, ToneMap};

pub trait F64Ext {
    #[must_use]
    fn square(self) -> Self;
}
impl F64Ext for f64 {
    fn square(self) -> Self {
        self * self
    }
}

/// A point in R³ × \[0, 1\]: spatial coordinates and a color coordinate.
#[derive(Debug, Default, PartialEq, Clone, Copy)]
pub struct Point {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    /// Color coordinate, indexing the palette.
    pub c: f64,
}
impl Point {
    #[must_use]
    pub const fn new(x: f64, y: f64, z: f64, c: f64) -> Self {
        Self { x, y, z, c }
    }
    /// Whether the spatial coordinates are finite and the color coordinate is
    /// in `[0, 1]`.
    #[must_use]
    #[inline]
    pub fn is_valid(self) -> bool {
        self.x.is_finite()
            && self.y.is_finite()
            && self.z.is_finite()
            && (0.0..=1.0).contains(&self.c)
    }
    /// Squared distance from the origin in the x/y plane.
    #[must_use]
    pub fn r2(self) -> f64 {
        self.x.square() + self.y.square()
    }
}

/// A function ("variation") that transforms points.
///
/// Implementations are shared between all workers of a render, so
/// [`Func::calc`] takes `&self`. Anything expensive that depends only on the
/// function's parameters belongs in [`Func::prep`], which is called once,
/// with exclusive access, before workers start.
pub trait Func: Send + Sync {
    /// Calculate the function at a point.
    fn calc(&self, p: Point, rng: &mut ChaosRng) -> Point;
    /// Cache calculations ahead of iteration.
    fn prep(&mut self) {}
}
impl<F: Func + ?Sized> Func for Box<F> {
    fn calc(&self, p: Point, rng: &mut ChaosRng) -> Point {
        (**self).calc(p, rng)
    }
    fn prep(&mut self) {
        (**self).prep();
    }
}
