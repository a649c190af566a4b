use crate::{
    solver::{
        Offsets, PhysicsItem, State, StateDelta,
        descriptor::SystemDescriptor,
        variables::{Variables, VariablesKey},
    },
    system::Items,
};
use nalgebra::{DMatrix, DVector, Matrix3, Quaternion, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use transforms::Transform;

#[derive(Debug, Clone, Copy, Error, PartialEq)]
pub enum BodyErrors {
    #[error("mass must be finite and greater than 0.0, got {0}")]
    InvalidMass(f64),
    #[error("inertia must be symmetric positive definite")]
    InvalidInertia,
}

/// A free rigid body with its center of mass at the body frame origin.
///
/// Position coordinates are the origin and the attitude quaternion (w, x, y, z), 7 in total.
/// Speed coordinates are the linear and angular velocity, both in the absolute frame, 6 in total.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Body {
    pub name: String,
    mass: f64,
    /// inertia about the center of mass, in the body frame
    inertia: Matrix3<f64>,
    /// absolute_from_body
    pub transform: Transform,
    pub velocity: Vector3<f64>,
    pub angular_velocity: Vector3<f64>,
    #[serde(skip)]
    pub acceleration: Vector3<f64>,
    #[serde(skip)]
    pub angular_acceleration: Vector3<f64>,
    /// external force at the center of mass, absolute frame
    #[serde(skip)]
    pub applied_force: Vector3<f64>,
    /// external torque, absolute frame
    #[serde(skip)]
    pub applied_torque: Vector3<f64>,
    pub fixed: bool,
    #[serde(skip)]
    pub(crate) offsets: Offsets,
    #[serde(skip)]
    pub(crate) variables: Option<VariablesKey>,
}

impl Default for Body {
    fn default() -> Self {
        Self {
            name: String::new(),
            mass: 1.0,
            inertia: Matrix3::identity(),
            transform: Transform::identity(),
            velocity: Vector3::zeros(),
            angular_velocity: Vector3::zeros(),
            acceleration: Vector3::zeros(),
            angular_acceleration: Vector3::zeros(),
            applied_force: Vector3::zeros(),
            applied_torque: Vector3::zeros(),
            fixed: false,
            offsets: Offsets::default(),
            variables: None,
        }
    }
}

impl Body {
    pub fn new(mass: f64, inertia: Matrix3<f64>) -> Result<Self, BodyErrors> {
        let mut body = Self::default();
        body.set_mass(mass)?;
        body.set_inertia(inertia)?;
        Ok(body)
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_position(mut self, position: Vector3<f64>) -> Self {
        self.transform.translation = position;
        self
    }

    pub fn with_rotation(mut self, rotation: UnitQuaternion<f64>) -> Self {
        self.transform.rotation = rotation;
        self
    }

    pub fn with_velocity(mut self, velocity: Vector3<f64>) -> Self {
        self.velocity = velocity;
        self
    }

    pub fn with_angular_velocity(mut self, angular_velocity: Vector3<f64>) -> Self {
        self.angular_velocity = angular_velocity;
        self
    }

    pub fn with_fixed(mut self, fixed: bool) -> Self {
        self.fixed = fixed;
        self
    }

    pub fn mass(&self) -> f64 {
        self.mass
    }

    pub fn set_mass(&mut self, mass: f64) -> Result<(), BodyErrors> {
        if !(mass.is_finite() && mass > 0.0) {
            return Err(BodyErrors::InvalidMass(mass));
        }
        self.mass = mass;
        Ok(())
    }

    pub fn inertia(&self) -> &Matrix3<f64> {
        &self.inertia
    }

    pub fn set_inertia(&mut self, inertia: Matrix3<f64>) -> Result<(), BodyErrors> {
        if (inertia - inertia.transpose()).abs().max() > 1e-12 * inertia.abs().max()
            || inertia.cholesky().is_none()
        {
            return Err(BodyErrors::InvalidInertia);
        }
        self.inertia = inertia;
        Ok(())
    }

    pub fn position(&self) -> Vector3<f64> {
        self.transform.translation
    }

    /// Inertia about the center of mass expressed in the absolute frame.
    pub fn inertia_absolute(&self) -> Matrix3<f64> {
        let r = self.transform.rotation.to_rotation_matrix();
        r.matrix() * self.inertia * r.matrix().transpose()
    }

    /// Velocity of a point fixed to the body, given in absolute coordinates.
    pub fn point_velocity(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.velocity + self.angular_velocity.cross(&(point - self.transform.translation))
    }

    pub fn offsets(&self) -> Offsets {
        self.offsets
    }

    pub fn variables_key(&self) -> Option<VariablesKey> {
        self.variables
    }

    fn mass_matrix(&self) -> DMatrix<f64> {
        let mut m = DMatrix::zeros(6, 6);
        m.view_mut((0, 0), (3, 3))
            .copy_from(&(Matrix3::identity() * self.mass));
        m.view_mut((3, 3), (3, 3))
            .copy_from(&self.inertia_absolute());
        m
    }

    /// Applied and gravity force, and applied torque less the gyroscopic term.
    fn generalized_force(&self, gravity: &Vector3<f64>) -> (Vector3<f64>, Vector3<f64>) {
        let force = self.applied_force + gravity * self.mass;
        let w = &self.angular_velocity;
        let torque = self.applied_torque - w.cross(&(self.inertia_absolute() * w));
        (force, torque)
    }

    fn variables_in<'a>(&self, descriptor: &'a mut SystemDescriptor) -> Option<&'a mut Variables> {
        descriptor.variables_mut(self.variables?)
    }
}

fn quaternion_from_state(x: &State, off_x: usize) -> UnitQuaternion<f64> {
    UnitQuaternion::from_quaternion(Quaternion::new(
        x[off_x + 3],
        x[off_x + 4],
        x[off_x + 5],
        x[off_x + 6],
    ))
}

impl PhysicsItem for Body {
    fn n_coords_pos(&self) -> usize {
        7
    }
    fn n_coords_vel(&self) -> usize {
        6
    }

    fn int_state_gather(
        &self,
        off_x: usize,
        x: &mut State,
        off_v: usize,
        v: &mut StateDelta,
        _t: &mut f64,
    ) {
        let q = self.transform.rotation.quaternion();
        x.fixed_rows_mut::<3>(off_x)
            .copy_from(&self.transform.translation);
        x[off_x + 3] = q.w;
        x[off_x + 4] = q.i;
        x[off_x + 5] = q.j;
        x[off_x + 6] = q.k;
        v.fixed_rows_mut::<3>(off_v).copy_from(&self.velocity);
        v.fixed_rows_mut::<3>(off_v + 3)
            .copy_from(&self.angular_velocity);
    }

    fn int_state_scatter(
        &mut self,
        off_x: usize,
        x: &State,
        off_v: usize,
        v: &StateDelta,
        _t: f64,
    ) {
        self.transform.translation = x.fixed_rows::<3>(off_x).clone_owned();
        self.transform.rotation = quaternion_from_state(x, off_x);
        self.velocity = v.fixed_rows::<3>(off_v).clone_owned();
        self.angular_velocity = v.fixed_rows::<3>(off_v + 3).clone_owned();
    }

    fn int_state_gather_acceleration(&self, off_a: usize, a: &mut StateDelta) {
        a.fixed_rows_mut::<3>(off_a).copy_from(&self.acceleration);
        a.fixed_rows_mut::<3>(off_a + 3)
            .copy_from(&self.angular_acceleration);
    }

    fn int_state_scatter_acceleration(&mut self, off_a: usize, a: &StateDelta) {
        self.acceleration = a.fixed_rows::<3>(off_a).clone_owned();
        self.angular_acceleration = a.fixed_rows::<3>(off_a + 3).clone_owned();
    }

    /// Translation adds, rotation composes: `q_new = exp(dw) * q` with `dw` in the absolute frame.
    fn int_state_increment(
        &self,
        off_x: usize,
        x_new: &mut State,
        x: &State,
        off_v: usize,
        dv: &StateDelta,
    ) {
        for i in 0..3 {
            x_new[off_x + i] = x[off_x + i] + dv[off_v + i];
        }
        let dw: Vector3<f64> = dv.fixed_rows::<3>(off_v + 3).clone_owned();
        let q = UnitQuaternion::from_scaled_axis(dw) * quaternion_from_state(x, off_x);
        x_new[off_x + 3] = q.w;
        x_new[off_x + 4] = q.i;
        x_new[off_x + 5] = q.j;
        x_new[off_x + 6] = q.k;
    }

    fn int_load_residual_f(&self, items: &Items, off_v: usize, r: &mut DVector<f64>, c: f64) {
        let (force, torque) = self.generalized_force(&items.gravity);
        r.fixed_rows_mut::<3>(off_v).axpy(c, &force, 1.0);
        r.fixed_rows_mut::<3>(off_v + 3).axpy(c, &torque, 1.0);
    }

    fn int_load_residual_mv(&self, off_v: usize, r: &mut DVector<f64>, w: &DVector<f64>, c: f64) {
        let mw = self.mass_matrix() * w.rows(off_v, 6);
        r.rows_mut(off_v, 6).axpy(c, &mw, 1.0);
    }

    fn int_load_lumped_mass_md(&self, off_v: usize, md: &mut DVector<f64>, err: &mut f64, c: f64) {
        let inertia = self.inertia_absolute();
        for i in 0..3 {
            md[off_v + i] += c * self.mass;
            md[off_v + 3 + i] += c * inertia[(i, i)];
        }
        *err += c * (inertia.abs().sum() - inertia.diagonal().abs().sum());
    }

    fn int_to_descriptor(
        &self,
        descriptor: &mut SystemDescriptor,
        off_v: usize,
        v: &StateDelta,
        r: &DVector<f64>,
        _off_l: usize,
        _l: &DVector<f64>,
        _qc: &DVector<f64>,
    ) {
        let mass = self.mass_matrix();
        if let Some(variables) = self.variables_in(descriptor) {
            variables.mass = mass;
            variables.qb.copy_from(&v.rows(off_v, 6));
            variables.fb.copy_from(&r.rows(off_v, 6));
            variables.active = !self.fixed;
        }
    }

    fn int_from_descriptor(
        &self,
        descriptor: &SystemDescriptor,
        off_v: usize,
        v: &mut StateDelta,
        _off_l: usize,
        _l: &mut DVector<f64>,
    ) {
        if let Some(variables) = self.variables.and_then(|key| descriptor.variables(key)) {
            v.rows_mut(off_v, 6).copy_from(&variables.qb);
        }
    }

    fn inject_variables(&mut self, descriptor: &mut SystemDescriptor) {
        let mut variables = Variables::new(self.mass_matrix());
        variables.active = !self.fixed;
        self.variables = Some(descriptor.insert_variables(variables));
    }

    fn variables_fb_reset(&self, descriptor: &mut SystemDescriptor) {
        let mass = self.mass_matrix();
        if let Some(variables) = self.variables_in(descriptor) {
            variables.fb.fill(0.0);
            // world inertia follows the attitude
            variables.mass = mass;
            variables.active = !self.fixed;
        }
    }

    fn variables_fb_load_forces(
        &self,
        items: &Items,
        descriptor: &mut SystemDescriptor,
        factor: f64,
    ) {
        let (force, torque) = self.generalized_force(&items.gravity);
        if let Some(variables) = self.variables_in(descriptor) {
            variables.fb.fixed_rows_mut::<3>(0).axpy(factor, &force, 1.0);
            variables.fb.fixed_rows_mut::<3>(3).axpy(factor, &torque, 1.0);
        }
    }

    fn variables_qb_load_speed(&self, descriptor: &mut SystemDescriptor) {
        if let Some(variables) = self.variables_in(descriptor) {
            variables.qb.fixed_rows_mut::<3>(0).copy_from(&self.velocity);
            variables
                .qb
                .fixed_rows_mut::<3>(3)
                .copy_from(&self.angular_velocity);
        }
    }

    fn variables_fb_increment_mq(&self, descriptor: &mut SystemDescriptor) {
        if let Some(variables) = self.variables_in(descriptor) {
            variables.compute_mass_times_qb_into_fb();
        }
    }

    fn variables_qb_set_speed(&mut self, descriptor: &SystemDescriptor, step: f64) {
        let Some(variables) = self.variables.and_then(|key| descriptor.variables(key)) else {
            return;
        };
        let velocity: Vector3<f64> = variables.qb.fixed_rows::<3>(0).clone_owned();
        let angular_velocity: Vector3<f64> = variables.qb.fixed_rows::<3>(3).clone_owned();
        if step != 0.0 {
            self.acceleration = (velocity - self.velocity) / step;
            self.angular_acceleration = (angular_velocity - self.angular_velocity) / step;
        }
        self.velocity = velocity;
        self.angular_velocity = angular_velocity;
    }

    fn variables_qb_increment_position(&mut self, step: f64) {
        if self.fixed {
            return;
        }
        self.transform.translation += self.velocity * step;
        let spin = UnitQuaternion::from_scaled_axis(self.angular_velocity * step);
        self.transform.rotation = spin * self.transform.rotation;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::f64::consts::FRAC_PI_2;
    const TOL: f64 = 1e-12;

    #[test]
    fn test_invalid_mass_properties() {
        assert_eq!(
            Body::new(0.0, Matrix3::identity()).unwrap_err(),
            BodyErrors::InvalidMass(0.0)
        );
        let not_spd = Matrix3::from_diagonal(&Vector3::new(1.0, -1.0, 1.0));
        assert_eq!(Body::new(1.0, not_spd).unwrap_err(), BodyErrors::InvalidInertia);
        let mut asym = Matrix3::identity();
        asym[(0, 1)] = 0.5;
        assert_eq!(Body::new(1.0, asym).unwrap_err(), BodyErrors::InvalidInertia);
    }

    #[test]
    fn test_inertia_absolute() {
        let inertia = Matrix3::from_diagonal(&Vector3::new(1.0, 2.0, 3.0));
        let body = Body::new(1.0, inertia)
            .unwrap()
            .with_rotation(UnitQuaternion::from_axis_angle(&Vector3::z_axis(), FRAC_PI_2));
        // body x lies along absolute y
        let expected = Matrix3::from_diagonal(&Vector3::new(2.0, 1.0, 3.0));
        assert_abs_diff_eq!(body.inertia_absolute(), expected, epsilon = TOL);
    }

    #[test]
    fn test_gather_scatter_round_trip() {
        let body = Body::new(2.0, Matrix3::identity())
            .unwrap()
            .with_position(Vector3::new(1.0, 2.0, 3.0))
            .with_rotation(UnitQuaternion::from_euler_angles(0.1, 0.2, 0.3))
            .with_velocity(Vector3::new(-1.0, 0.0, 1.0))
            .with_angular_velocity(Vector3::new(0.0, 0.5, 0.0));
        let mut x = State::zeros(8);
        let mut v = StateDelta::zeros(7);
        let mut t = 0.0;
        body.int_state_gather(1, &mut x, 1, &mut v, &mut t);

        let mut other = Body::default();
        other.int_state_scatter(1, &x, 1, &v, 0.0);
        assert_abs_diff_eq!(other.transform, body.transform, epsilon = TOL);
        assert_abs_diff_eq!(other.velocity, body.velocity, epsilon = TOL);
        assert_abs_diff_eq!(other.angular_velocity, body.angular_velocity, epsilon = TOL);
    }

    #[test]
    fn test_state_increment_rotates_quaternion() {
        let body = Body::default();
        let mut x = State::zeros(7);
        let mut v = StateDelta::zeros(6);
        let mut t = 0.0;
        body.int_state_gather(0, &mut x, 0, &mut v, &mut t);

        let mut dv = StateDelta::zeros(6);
        dv[0] = 1.0;
        dv[5] = FRAC_PI_2;
        let mut x_new = x.clone();
        body.int_state_increment(0, &mut x_new, &x, 0, &dv);

        let mut moved = Body::default();
        moved.int_state_scatter(0, &x_new, 0, &v, 0.0);
        assert_abs_diff_eq!(moved.position(), Vector3::new(1.0, 0.0, 0.0), epsilon = TOL);
        assert_abs_diff_eq!(
            moved.transform.direction_to_parent(&Vector3::x()),
            Vector3::new(0.0, 1.0, 0.0),
            epsilon = TOL
        );
    }

    #[test]
    fn test_gyroscopic_torque() {
        let inertia = Matrix3::from_diagonal(&Vector3::new(1.0, 2.0, 3.0));
        let body = Body::new(1.0, inertia)
            .unwrap()
            .with_angular_velocity(Vector3::new(1.0, 1.0, 0.0));
        let (force, torque) = body.generalized_force(&Vector3::new(0.0, 0.0, -9.81));
        assert_abs_diff_eq!(force, Vector3::new(0.0, 0.0, -9.81), epsilon = TOL);
        // -w x (I w) = -(1,1,0) x (1,2,0) = -(0,0,1)
        assert_abs_diff_eq!(torque, Vector3::new(0.0, 0.0, -1.0), epsilon = TOL);
    }

    #[test]
    fn test_point_velocity() {
        let body = Body::default()
            .with_position(Vector3::new(1.0, 0.0, 0.0))
            .with_angular_velocity(Vector3::new(0.0, 0.0, 2.0));
        let v = body.point_velocity(&Vector3::new(1.0, 1.0, 0.0));
        assert_abs_diff_eq!(v, Vector3::new(-2.0, 0.0, 0.0), epsilon = TOL);
    }
}
