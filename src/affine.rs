//! Affine transforms in three dimensions.

use std::ops::{Index, IndexMut};

/// A 4×4 affine transform in row major order where the bottom row is
/// implicitly `[0 0 0 1]`.
///
/// Coefficients `0..3`, `4..7` and `8..11` are the rows of the linear part;
/// `3`, `7` and `11` form the translation vector.
///
/// All operations modify the transform in place and return it, so they can be
/// chained.
#[derive(Debug, PartialEq, Clone, Copy)]
pub struct Affine {
    m: [f64; 12],
}
impl Default for Affine {
    fn default() -> Self {
        Self::eye()
    }
}
impl Affine {
    /// The identity transform.
    #[must_use]
    pub const fn eye() -> Self {
        Self {
            m: [
                1., 0., 0., 0., //
                0., 1., 0., 0., //
                0., 0., 1., 0.,
            ],
        }
    }
    #[must_use]
    pub const fn from_coefficients(m: [f64; 12]) -> Self {
        Self { m }
    }
    #[must_use]
    pub const fn coefficients(&self) -> &[f64; 12] {
        &self.m
    }

    /// Set the transform back to the identity.
    pub fn reset(&mut self) -> &mut Self {
        *self = Self::eye();
        self
    }

    pub fn translate(&mut self, dx: f64, dy: f64, dz: f64) -> &mut Self {
        let m = &mut self.m;
        m[3] += dx;
        m[7] += dy;
        m[11] += dz;
        self
    }

    /// Scale along each axis. The translation vector is left alone.
    pub fn scale(&mut self, sx: f64, sy: f64, sz: f64) -> &mut Self {
        let m = &mut self.m;
        for row in [0, 4, 8] {
            m[row] *= sx;
            m[row + 1] *= sy;
            m[row + 2] *= sz;
        }
        self
    }

    /// Scale the linear part and the translation vector by one factor.
    pub fn zoom(&mut self, s: f64) -> &mut Self {
        self.m.iter_mut().for_each(|v| *v *= s);
        self
    }

    /// Counter-clockwise rotation in the y/z plane, in radians. The
    /// translation vector is rotated too.
    pub fn rot_x(&mut self, t: f64) -> &mut Self {
        let (s, c) = t.sin_cos();
        self.pitch_linear(s, c);
        let m = &mut self.m;
        (m[7], m[11]) = (m[7] * c + m[11] * s, -m[7] * s + m[11] * c);
        self
    }
    /// Rotation in the x/z plane, in radians. The translation vector is
    /// rotated too.
    pub fn rot_y(&mut self, t: f64) -> &mut Self {
        let (s, c) = t.sin_cos();
        self.roll_linear(s, c);
        let m = &mut self.m;
        (m[3], m[11]) = (m[3] * c - m[11] * s, m[3] * s + m[11] * c);
        self
    }
    /// Rotation in the x/y plane, in radians. The translation vector is
    /// rotated too.
    pub fn rot_z(&mut self, t: f64) -> &mut Self {
        let (s, c) = t.sin_cos();
        self.yaw_linear(s, c);
        let m = &mut self.m;
        (m[3], m[7]) = (m[3] * c + m[7] * s, -m[3] * s + m[7] * c);
        self
    }

    /// Rotate about the x axis centered on the translation point.
    pub fn pitch(&mut self, t: f64) -> &mut Self {
        let (s, c) = t.sin_cos();
        self.pitch_linear(s, c);
        self
    }
    /// Rotate about the y axis centered on the translation point.
    pub fn roll(&mut self, t: f64) -> &mut Self {
        let (s, c) = t.sin_cos();
        self.roll_linear(s, c);
        self
    }
    /// Rotate about the z axis centered on the translation point.
    pub fn yaw(&mut self, t: f64) -> &mut Self {
        let (s, c) = t.sin_cos();
        self.yaw_linear(s, c);
        self
    }

    fn pitch_linear(&mut self, s: f64, c: f64) {
        let m = &mut self.m;
        for row in [0, 4, 8] {
            let (y, z) = (m[row + 1], m[row + 2]);
            m[row + 1] = y * c - z * s;
            m[row + 2] = y * s + z * c;
        }
    }
    fn roll_linear(&mut self, s: f64, c: f64) {
        let m = &mut self.m;
        for row in [0, 4, 8] {
            let (x, z) = (m[row], m[row + 2]);
            m[row] = x * c + z * s;
            m[row + 2] = z * c - x * s;
        }
    }
    fn yaw_linear(&mut self, s: f64, c: f64) {
        let m = &mut self.m;
        for row in [0, 4, 8] {
            let (x, y) = (m[row], m[row + 1]);
            m[row] = x * c - y * s;
            m[row + 1] = x * s + y * c;
        }
    }

    /// The X vector of the transform, which is the first column.
    #[must_use]
    pub fn vx(&self) -> [f64; 3] {
        self.column(0)
    }
    #[must_use]
    pub fn vy(&self) -> [f64; 3] {
        self.column(1)
    }
    #[must_use]
    pub fn vz(&self) -> [f64; 3] {
        self.column(2)
    }
    /// The translation vector.
    #[must_use]
    pub fn vo(&self) -> [f64; 3] {
        self.column(3)
    }
    pub fn set_vx(&mut self, v: [f64; 3]) -> &mut Self {
        self.set_column(0, v)
    }
    pub fn set_vy(&mut self, v: [f64; 3]) -> &mut Self {
        self.set_column(1, v)
    }
    pub fn set_vz(&mut self, v: [f64; 3]) -> &mut Self {
        self.set_column(2, v)
    }
    pub fn set_vo(&mut self, v: [f64; 3]) -> &mut Self {
        self.set_column(3, v)
    }
    fn column(&self, i: usize) -> [f64; 3] {
        [self.m[i], self.m[i + 4], self.m[i + 8]]
    }
    fn set_column(&mut self, i: usize, v: [f64; 3]) -> &mut Self {
        self.m[i] = v[0];
        self.m[i + 4] = v[1];
        self.m[i + 8] = v[2];
        self
    }

    /// Transform a coordinate.
    #[must_use]
    #[inline]
    pub fn tx(&self, x: f64, y: f64, z: f64) -> (f64, f64, f64) {
        let m = &self.m;
        (
            m[0] * x + m[1] * y + m[2] * z + m[3],
            m[4] * x + m[5] * y + m[6] * z + m[7],
            m[8] * x + m[9] * y + m[10] * z + m[11],
        )
    }

    /// Area of the orthogonal projection into the x/y plane of a unit square
    /// under this transform, i.e. the determinant of the upper-left 2×2
    /// submatrix.
    #[must_use]
    pub fn proj_area(&self) -> f64 {
        let m = &self.m;
        (m[0] * m[5] - m[1] * m[4]).abs()
    }
}
impl Index<usize> for Affine {
    type Output = f64;
    fn index(&self, index: usize) -> &Self::Output {
        &self.m[index]
    }
}
impl IndexMut<usize> for Affine {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.m[index]
    }
}
