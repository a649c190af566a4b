use approx::AbsDiffEq;
use nalgebra::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use std::ops::Mul;

/// A rigid frame: translation plus rotation of a child frame with respect to its parent.
///
/// We use the terminology B_from_A rather than A_to_B so that notation matches matrix multiplication,
/// i.e. a point in frame A is expressed in frame C with `p_c = c_from_b * b_from_a * p_a`.
/// A `Transform` stored on an item (body, link) is always `parent_from_item`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    /// origin of the child frame, expressed in the parent frame
    pub translation: Vector3<f64>,
    /// orientation of the child frame with respect to the parent frame
    pub rotation: UnitQuaternion<f64>,
}

impl Default for Transform {
    fn default() -> Self {
        Self::identity()
    }
}

impl Transform {
    pub fn identity() -> Self {
        Self {
            translation: Vector3::zeros(),
            rotation: UnitQuaternion::identity(),
        }
    }

    pub fn new(translation: Vector3<f64>, rotation: UnitQuaternion<f64>) -> Self {
        Self {
            translation,
            rotation,
        }
    }

    pub fn from_translation(translation: Vector3<f64>) -> Self {
        Self {
            translation,
            rotation: UnitQuaternion::identity(),
        }
    }

    pub fn from_rotation(rotation: UnitQuaternion<f64>) -> Self {
        Self {
            translation: Vector3::zeros(),
            rotation,
        }
    }

    /// Frame rotated by `angle` about the parent X axis, with no translation.
    /// This is the frame of a 1-dof rotating shaft.
    pub fn about_x(angle: f64) -> Self {
        Self::from_rotation(UnitQuaternion::from_axis_angle(&Vector3::x_axis(), angle))
    }

    /// Returns the inverse transform, i.e. `a_from_b` given `b_from_a`.
    pub fn inv(&self) -> Self {
        let rotation = self.rotation.inverse();
        Self {
            translation: -(rotation * self.translation),
            rotation,
        }
    }

    /// Expresses a point given in the child frame in the parent frame.
    pub fn point_to_parent(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.translation + self.rotation * p
    }

    /// Expresses a point given in the parent frame in the child frame.
    pub fn point_to_local(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation.inverse() * (p - self.translation)
    }

    /// Rotates a free vector (force, torque, direction) from the child frame into the parent frame.
    pub fn direction_to_parent(&self, v: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * v
    }

    /// Rotates a free vector from the parent frame into the child frame.
    pub fn direction_to_local(&self, v: &Vector3<f64>) -> Vector3<f64> {
        self.rotation.inverse() * v
    }

    /// Builds a frame at `origin` whose X axis points along `x_dir`.
    /// Y and Z are completed with the smallest rotation taking X onto `x_dir`.
    /// Returns None if `x_dir` is (numerically) zero.
    pub fn from_x_axis(origin: Vector3<f64>, x_dir: &Vector3<f64>) -> Option<Self> {
        let norm = x_dir.norm();
        if norm < f64::EPSILON {
            return None;
        }
        let x = x_dir / norm;
        let rotation = match UnitQuaternion::rotation_between(&Vector3::x(), &x) {
            Some(q) => q,
            // antiparallel: any half turn about an axis normal to X works
            None => UnitQuaternion::from_axis_angle(&Vector3::z_axis(), std::f64::consts::PI),
        };
        Some(Self::new(origin, rotation))
    }
}

impl Mul<Transform> for Transform {
    type Output = Transform;

    /// `c_from_b * b_from_a = c_from_a`
    fn mul(self, rhs: Transform) -> Transform {
        Transform {
            translation: self.translation + self.rotation * rhs.translation,
            rotation: self.rotation * rhs.rotation,
        }
    }
}

impl Mul<Vector3<f64>> for Transform {
    type Output = Vector3<f64>;

    /// Transforms a point from the child frame to the parent frame.
    fn mul(self, rhs: Vector3<f64>) -> Vector3<f64> {
        self.point_to_parent(&rhs)
    }
}

impl AbsDiffEq for Transform {
    type Epsilon = f64;

    fn default_epsilon() -> f64 {
        f64::EPSILON
    }

    fn abs_diff_eq(&self, other: &Self, epsilon: f64) -> bool {
        self.translation.abs_diff_eq(&other.translation, epsilon)
            && self.rotation.abs_diff_eq(&other.rotation, epsilon)
    }
}
