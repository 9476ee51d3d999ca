//! Common types for 3D geometry.
//!
//! The engine uses a right-handed frame with `y` pointing up: `x` and `z`
//! span the floor plane, and yaw rotates about `y`.

use std::ops::{Add, AddAssign, Mul, Neg, Sub};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Global numerical tolerance for floating-point comparisons.
pub const EPSILON_GENERAL: f64 = 1e-6;

/// Tolerance used when comparing energies and tie-break keys.
pub const EPSILON_SCORE: f64 = 1e-9;

/// Represents a 3D vector or point in space.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    /// Creates a new 3D vector.
    #[inline]
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Creates a zero vector (origin).
    #[inline]
    pub const fn zero() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }

    /// Creates a vector with all components set to `v`.
    #[inline]
    pub const fn splat(v: f64) -> Self {
        Self::new(v, v, v)
    }

    /// Converts to tuple format for API compatibility.
    #[inline]
    pub const fn as_tuple(&self) -> (f64, f64, f64) {
        (self.x, self.y, self.z)
    }

    /// Creates from tuple format.
    #[inline]
    pub const fn from_tuple(tuple: (f64, f64, f64)) -> Self {
        Self::new(tuple.0, tuple.1, tuple.2)
    }

    /// Component by axis index (0 = x, 1 = y, 2 = z).
    #[inline]
    pub fn axis(&self, index: usize) -> f64 {
        match index {
            0 => self.x,
            1 => self.y,
            _ => self.z,
        }
    }

    /// Copy with the component at `index` replaced.
    #[inline]
    pub fn with_axis(mut self, index: usize, value: f64) -> Self {
        match index {
            0 => self.x = value,
            1 => self.y = value,
            _ => self.z = value,
        }
        self
    }

    #[inline]
    pub fn dot(&self, other: &Self) -> f64 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    #[inline]
    pub fn cross(&self, other: &Self) -> Self {
        Self::new(
            self.y * other.z - self.z * other.y,
            self.z * other.x - self.x * other.z,
            self.x * other.y - self.y * other.x,
        )
    }

    #[inline]
    pub fn length_squared(&self) -> f64 {
        self.dot(self)
    }

    #[inline]
    pub fn length(&self) -> f64 {
        self.length_squared().sqrt()
    }

    /// Squared Euclidean distance to another point.
    #[inline]
    pub fn distance_squared(&self, other: &Self) -> f64 {
        (*self - *other).length_squared()
    }

    /// Euclidean distance to another point.
    #[inline]
    pub fn distance_to(&self, other: &Self) -> f64 {
        self.distance_squared(other).sqrt()
    }

    /// Component-wise minimum.
    #[inline]
    pub fn min(&self, other: &Self) -> Self {
        Self::new(self.x.min(other.x), self.y.min(other.y), self.z.min(other.z))
    }

    /// Component-wise maximum.
    #[inline]
    pub fn max(&self, other: &Self) -> Self {
        Self::new(self.x.max(other.x), self.y.max(other.y), self.z.max(other.z))
    }

    /// Rotates the vector about the `y` axis by `yaw` radians.
    #[inline]
    pub fn rotate_y(&self, yaw: f64) -> Self {
        let (s, c) = yaw.sin_cos();
        Self::new(c * self.x + s * self.z, self.y, -s * self.x + c * self.z)
    }

    /// Calculates the volume (product of all components).
    ///
    /// Useful for dimension vectors.
    #[inline]
    pub fn volume(&self) -> f64 {
        self.x * self.y * self.z
    }

    /// Checks if all components are positive and finite.
    #[inline]
    pub fn is_valid_dimension(&self) -> bool {
        self.x > 0.0
            && self.y > 0.0
            && self.z > 0.0
            && self.x.is_finite()
            && self.y.is_finite()
            && self.z.is_finite()
    }

    #[inline]
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

impl Add for Vec3 {
    type Output = Self;

    #[inline]
    fn add(self, rhs: Self) -> Self::Output {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl AddAssign for Vec3 {
    #[inline]
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for Vec3 {
    type Output = Self;

    #[inline]
    fn sub(self, rhs: Self) -> Self::Output {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Mul<f64> for Vec3 {
    type Output = Self;

    #[inline]
    fn mul(self, scalar: f64) -> Self::Output {
        Self::new(self.x * scalar, self.y * scalar, self.z * scalar)
    }
}

impl Neg for Vec3 {
    type Output = Self;

    #[inline]
    fn neg(self) -> Self::Output {
        Self::new(-self.x, -self.y, -self.z)
    }
}

impl From<(f64, f64, f64)> for Vec3 {
    #[inline]
    fn from(tuple: (f64, f64, f64)) -> Self {
        Self::from_tuple(tuple)
    }
}

impl From<Vec3> for (f64, f64, f64) {
    #[inline]
    fn from(vec: Vec3) -> Self {
        vec.as_tuple()
    }
}

/// Represents an Axis-Aligned Bounding Box (AABB).
///
/// Used for the broad phase of collision detection, zone bounds and
/// voxel occupancy.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aabb {
    /// Minimum corner
    pub min: Vec3,
    /// Maximum corner
    pub max: Vec3,
}

impl Aabb {
    /// Creates a new bounding box.
    #[inline]
    pub const fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Creates a bounding box from its center and half extents.
    #[inline]
    pub fn from_center_half(center: Vec3, half: Vec3) -> Self {
        Self {
            min: center - half,
            max: center + half,
        }
    }

    /// Smallest box enclosing both boxes.
    #[inline]
    pub fn union(&self, other: &Self) -> Self {
        Self::new(self.min.min(&other.min), self.max.max(&other.max))
    }

    /// Shrinks every face inwards by `margin`, never past the center.
    #[inline]
    pub fn shrink(&self, margin: f64) -> Self {
        let half = self.half_size();
        let shrunk = Vec3::new(
            (half.x - margin).max(0.0),
            (half.y - margin).max(0.0),
            (half.z - margin).max(0.0),
        );
        Self::from_center_half(self.center(), shrunk)
    }

    /// Checks if two bounding boxes intersect with positive volume.
    ///
    /// Touching faces do not count as an intersection.
    #[inline]
    pub fn intersects(&self, other: &Self) -> bool {
        !(self.max.x <= other.min.x
            || other.max.x <= self.min.x
            || self.max.y <= other.min.y
            || other.max.y <= self.min.y
            || self.max.z <= other.min.z
            || other.max.z <= self.min.z)
    }

    /// Overlap length along one axis, at least 0.0.
    #[inline]
    pub fn overlap_on_axis(&self, other: &Self, axis: usize) -> f64 {
        overlap_1d(
            self.min.axis(axis),
            self.max.axis(axis),
            other.min.axis(axis),
            other.max.axis(axis),
        )
    }

    /// Checks if a point is inside the bounding box (boundary inclusive).
    #[inline]
    pub fn contains_point(&self, point: &Vec3) -> bool {
        point.x >= self.min.x
            && point.x <= self.max.x
            && point.y >= self.min.y
            && point.y <= self.max.y
            && point.z >= self.min.z
            && point.z <= self.max.z
    }

    /// Checks if `other` lies completely inside this box, with tolerance.
    #[inline]
    pub fn contains_aabb(&self, other: &Self, tolerance: f64) -> bool {
        other.min.x >= self.min.x - tolerance
            && other.max.x <= self.max.x + tolerance
            && other.min.y >= self.min.y - tolerance
            && other.max.y <= self.max.y + tolerance
            && other.min.z >= self.min.z - tolerance
            && other.max.z <= self.max.z + tolerance
    }

    /// Returns the center point.
    #[inline]
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Returns the dimensions (width, height, depth).
    #[inline]
    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    #[inline]
    pub fn half_size(&self) -> Vec3 {
        self.size() * 0.5
    }

    #[inline]
    pub fn volume(&self) -> f64 {
        self.size().volume()
    }
}

/// Overlap length of two intervals, at least 0.0.
#[inline]
pub fn overlap_1d(a1: f64, a2: f64, b1: f64, b2: f64) -> f64 {
    (a2.min(b2) - a1.max(b1)).max(0.0)
}

/// Validation functions for object geometry.
pub mod validation {
    use super::*;

    /// Validates a single extent.
    ///
    /// # Parameters
    /// * `value` - The value to validate
    /// * `name` - Name of the dimension for error messages
    pub fn validate_dimension(value: f64, name: &str) -> Result<()> {
        if value.is_nan() {
            return Err(EngineError::DegenerateGeometry(format!(
                "{} must not be NaN",
                name
            )));
        }
        if value.is_infinite() {
            return Err(EngineError::DegenerateGeometry(format!(
                "{} must not be infinite",
                name
            )));
        }
        if value <= 0.0 {
            return Err(EngineError::DegenerateGeometry(format!(
                "{} must be positive, got: {}",
                name, value
            )));
        }
        Ok(())
    }

    /// Validates all three extents of a 3D object.
    pub fn validate_dimensions_3d(dims: Vec3) -> Result<()> {
        validate_dimension(dims.x, "Width")?;
        validate_dimension(dims.y, "Height")?;
        validate_dimension(dims.z, "Depth")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn test_vec3_operations() {
        let a = Vec3::new(1.0, 2.0, 3.0);
        let b = Vec3::new(4.0, 5.0, 6.0);

        assert_eq!(a + b, Vec3::new(5.0, 7.0, 9.0));
        assert_eq!(b - a, Vec3::new(3.0, 3.0, 3.0));
        assert_eq!(a * 2.0, Vec3::new(2.0, 4.0, 6.0));
        assert_eq!(-a, Vec3::new(-1.0, -2.0, -3.0));
        assert_relative_eq!(a.dot(&b), 32.0);
        assert_eq!(
            Vec3::new(1.0, 0.0, 0.0).cross(&Vec3::new(0.0, 1.0, 0.0)),
            Vec3::new(0.0, 0.0, 1.0)
        );
    }

    #[test]
    fn test_rotate_y_quarter_turn() {
        let v = Vec3::new(1.0, 2.0, 0.0).rotate_y(FRAC_PI_2);
        assert_relative_eq!(v.x, 0.0, epsilon = 1e-12);
        assert_relative_eq!(v.y, 2.0);
        assert_relative_eq!(v.z, -1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_aabb_intersects_excludes_touching() {
        let a = Aabb::new(Vec3::zero(), Vec3::splat(10.0));
        let b = Aabb::new(Vec3::splat(5.0), Vec3::splat(15.0));
        let c = Aabb::new(Vec3::new(10.0, 0.0, 0.0), Vec3::new(20.0, 10.0, 10.0));

        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));
    }

    #[test]
    fn test_aabb_shrink_stops_at_center() {
        let a = Aabb::new(Vec3::zero(), Vec3::new(10.0, 0.2, 10.0));
        let s = a.shrink(0.25);
        assert_relative_eq!(s.min.x, 0.25);
        assert_relative_eq!(s.max.x, 9.75);
        assert_relative_eq!(s.min.y, 0.1);
        assert_relative_eq!(s.max.y, 0.1);
    }

    #[test]
    fn test_aabb_overlap_on_axis() {
        let a = Aabb::new(Vec3::zero(), Vec3::splat(10.0));
        let b = Aabb::new(Vec3::new(7.0, -3.0, 20.0), Vec3::new(12.0, 2.0, 30.0));
        assert_relative_eq!(a.overlap_on_axis(&b, 0), 3.0);
        assert_relative_eq!(a.overlap_on_axis(&b, 1), 2.0);
        assert_relative_eq!(a.overlap_on_axis(&b, 2), 0.0);
    }

    #[test]
    fn test_validation_dimension() {
        assert!(validation::validate_dimension(10.0, "Width").is_ok());
        assert!(validation::validate_dimension(0.0, "Width").is_err());
        assert!(validation::validate_dimension(-1.0, "Width").is_err());
        assert!(validation::validate_dimension(f64::NAN, "Width").is_err());
        assert!(validation::validate_dimension(f64::INFINITY, "Width").is_err());
    }
}
