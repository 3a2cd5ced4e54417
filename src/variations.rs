//! A few common flame functions and a registry to construct functions by
//! name.

use std::collections::BTreeMap;

use crate::{Affine, ChaosRng, Func, Point};

/// An affine transform of the spatial coordinates which also pulls the color
/// coordinate towards `color`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineFunc {
    pub transform: Affine,
    /// Target color coordinate, in `[0, 1]`.
    pub color: f64,
    /// How far the color coordinate moves towards `color` each application,
    /// in `[0, 1]`.
    pub blend: f64,
}
impl AffineFunc {
    #[must_use]
    pub fn new(transform: Affine, color: f64) -> Self {
        Self {
            transform,
            color,
            blend: 0.5,
        }
    }
}
impl Default for AffineFunc {
    fn default() -> Self {
        Self::new(Affine::eye(), 0.)
    }
}
impl Func for AffineFunc {
    fn calc(&self, p: Point, _: &mut ChaosRng) -> Point {
        let (x, y, z) = self.transform.tx(p.x, p.y, p.z);
        Point {
            x,
            y,
            z,
            c: p.c + (self.color - p.c) * self.blend,
        }
    }
}

/// Inversion through the unit circle in the x/y plane.
#[derive(Debug, Default, Clone, Copy)]
pub struct Spherical;
impl Func for Spherical {
    fn calc(&self, p: Point, _: &mut ChaosRng) -> Point {
        let r2 = p.r2();
        Point {
            x: p.x / r2,
            y: p.y / r2,
            ..p
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Sinusoidal;
impl Func for Sinusoidal {
    fn calc(&self, p: Point, _: &mut ChaosRng) -> Point {
        Point {
            x: p.x.sin(),
            y: p.y.sin(),
            ..p
        }
    }
}

/// Gaussian jitter in the x/y plane.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Blur {
    /// Standard deviation of the jitter.
    pub amount: f64,
}
impl Default for Blur {
    fn default() -> Self {
        Self { amount: 0.1 }
    }
}
impl Func for Blur {
    fn calc(&self, p: Point, rng: &mut ChaosRng) -> Point {
        Point {
            x: p.x + self.amount * rng.normal(),
            y: p.y + self.amount * rng.normal(),
            ..p
        }
    }
}

/// Polar coordinates: angle over π and distance minus one.
#[derive(Debug, Default, Clone, Copy)]
pub struct Polar;
impl Func for Polar {
    fn calc(&self, p: Point, _: &mut ChaosRng) -> Point {
        Point {
            x: p.y.atan2(p.x) * std::f64::consts::FRAC_1_PI,
            y: p.r2().sqrt() - 1.,
            ..p
        }
    }
}

/// Swirl around the origin by `strength` radians per unit of squared
/// distance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Swirl {
    pub strength: f64,
}
impl Default for Swirl {
    fn default() -> Self {
        Self { strength: 1. }
    }
}
impl Func for Swirl {
    fn calc(&self, p: Point, _: &mut ChaosRng) -> Point {
        let (s, c) = (self.strength * p.r2()).sin_cos();
        Point {
            x: p.x * c - p.y * s,
            y: p.x * s + p.y * c,
            ..p
        }
    }
}

/// Rotation about the z axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rotate {
    /// Radians, counter-clockwise.
    pub angle: f64,
    sin_cos: (f64, f64),
}
impl Rotate {
    /// The rotation takes effect once prepped.
    #[must_use]
    pub fn new(angle: f64) -> Self {
        Self {
            angle,
            sin_cos: (0., 1.),
        }
    }
}
impl Func for Rotate {
    fn calc(&self, p: Point, _: &mut ChaosRng) -> Point {
        let (s, c) = self.sin_cos;
        Point {
            x: p.x * c - p.y * s,
            y: p.x * s + p.y * c,
            ..p
        }
    }
    fn prep(&mut self) {
        self.sin_cos = self.angle.sin_cos();
    }
}

/// Applies each function in order.
#[derive(Default)]
pub struct Then(pub Vec<Box<dyn Func>>);
impl Func for Then {
    fn calc(&self, p: Point, rng: &mut ChaosRng) -> Point {
        self.0.iter().fold(p, |p, f| f.calc(p, rng))
    }
    fn prep(&mut self) {
        self.0.iter_mut().for_each(|f| f.prep());
    }
}
impl std::fmt::Debug for Then {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Then({} functions)", self.0.len())
    }
}

/// Weighted sum of the spatial coordinates produced by several functions.
/// The color coordinate is taken from the input.
#[derive(Default)]
pub struct Sum(pub Vec<(f64, Box<dyn Func>)>);
impl Func for Sum {
    fn calc(&self, p: Point, rng: &mut ChaosRng) -> Point {
        let mut out = Point { c: p.c, ..Point::default() };
        for (w, f) in &self.0 {
            let q = f.calc(p, rng);
            out.x += w * q.x;
            out.y += w * q.y;
            out.z += w * q.z;
        }
        out
    }
    fn prep(&mut self) {
        self.0.iter_mut().for_each(|(_, f)| f.prep());
    }
}
impl std::fmt::Debug for Sum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.0.iter().map(|(w, _)| w))
            .finish()
    }
}

pub type Constructor = fn() -> Box<dyn Func>;

/// Function constructors by name.
///
/// Nothing is registered implicitly: build one with [`Registry::with_defaults`]
/// or [`Registry::register`] and pass it to whatever needs to construct
/// functions by name.
#[derive(Debug, Default, Clone)]
pub struct Registry {
    constructors: BTreeMap<String, Constructor>,
}
impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
    /// The functions in this module under lowercase names.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut r = Self::new();
        r.register("affine", || Box::new(AffineFunc::default()));
        r.register("blur", || Box::new(Blur::default()));
        r.register("polar", || Box::new(Polar));
        r.register("sinusoidal", || Box::new(Sinusoidal));
        r.register("spherical", || Box::new(Spherical));
        r.register("swirl", || Box::new(Swirl::default()));
        r
    }

    /// Returns the constructor previously registered under `name`.
    pub fn register(&mut self, name: impl Into<String>, f: Constructor) -> Option<Constructor> {
        self.constructors.insert(name.into(), f)
    }

    #[must_use]
    pub fn make(&self, name: &str) -> Option<Box<dyn Func>> {
        self.constructors.get(name).map(|f| f())
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }
}
