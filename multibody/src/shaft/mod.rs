use crate::{
    solver::{
        Offsets, PhysicsItem, State, StateDelta,
        descriptor::SystemDescriptor,
        variables::{Variables, VariablesKey},
    },
    system::Items,
};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use transforms::Transform;

#[derive(Debug, Clone, Copy, Error, PartialEq)]
pub enum ShaftErrors {
    #[error("shaft inertia must be finite and greater than 0.0, got {0}")]
    InvalidInertia(f64),
}

/// A 1-dof rotating element: one angle, one angular speed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shaft {
    pub name: String,
    inertia: f64,
    pub angle: f64,
    pub speed: f64,
    #[serde(skip)]
    pub acceleration: f64,
    /// external torque, constant over a step
    #[serde(skip)]
    pub applied_torque: f64,
    /// a fixed shaft never moves and has no unknowns in the solve
    pub fixed: bool,
    #[serde(skip)]
    pub(crate) offsets: Offsets,
    #[serde(skip)]
    pub(crate) variables: Option<VariablesKey>,
}

impl Default for Shaft {
    fn default() -> Self {
        Self {
            name: String::new(),
            inertia: 1.0,
            angle: 0.0,
            speed: 0.0,
            acceleration: 0.0,
            applied_torque: 0.0,
            fixed: false,
            offsets: Offsets::default(),
            variables: None,
        }
    }
}

impl Shaft {
    pub fn new(inertia: f64) -> Result<Self, ShaftErrors> {
        let mut shaft = Self::default();
        shaft.set_inertia(inertia)?;
        Ok(shaft)
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_angle(mut self, angle: f64) -> Self {
        self.angle = angle;
        self
    }

    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = speed;
        self
    }

    pub fn with_fixed(mut self, fixed: bool) -> Self {
        self.fixed = fixed;
        self
    }

    pub fn inertia(&self) -> f64 {
        self.inertia
    }

    pub fn set_inertia(&mut self, inertia: f64) -> Result<(), ShaftErrors> {
        if !(inertia.is_finite() && inertia > 0.0) {
            return Err(ShaftErrors::InvalidInertia(inertia));
        }
        self.inertia = inertia;
        Ok(())
    }

    /// Frame of the shaft: a rotation of `angle` about the shaft axis (X).
    pub fn transform(&self) -> Transform {
        Transform::about_x(self.angle)
    }

    pub fn offsets(&self) -> Offsets {
        self.offsets
    }

    pub fn variables_key(&self) -> Option<VariablesKey> {
        self.variables
    }

    fn variables_in<'a>(&self, descriptor: &'a mut SystemDescriptor) -> Option<&'a mut Variables> {
        descriptor.variables_mut(self.variables?)
    }
}

impl PhysicsItem for Shaft {
    fn n_coords_pos(&self) -> usize {
        1
    }
    fn n_coords_vel(&self) -> usize {
        1
    }

    fn int_state_gather(
        &self,
        off_x: usize,
        x: &mut State,
        off_v: usize,
        v: &mut StateDelta,
        _t: &mut f64,
    ) {
        x[off_x] = self.angle;
        v[off_v] = self.speed;
    }

    fn int_state_scatter(
        &mut self,
        off_x: usize,
        x: &State,
        off_v: usize,
        v: &StateDelta,
        _t: f64,
    ) {
        self.angle = x[off_x];
        self.speed = v[off_v];
    }

    fn int_state_gather_acceleration(&self, off_a: usize, a: &mut StateDelta) {
        a[off_a] = self.acceleration;
    }

    fn int_state_scatter_acceleration(&mut self, off_a: usize, a: &StateDelta) {
        self.acceleration = a[off_a];
    }

    fn int_load_residual_f(&self, _items: &Items, off_v: usize, r: &mut DVector<f64>, c: f64) {
        r[off_v] += c * self.applied_torque;
    }

    fn int_load_residual_mv(&self, off_v: usize, r: &mut DVector<f64>, w: &DVector<f64>, c: f64) {
        r[off_v] += c * self.inertia * w[off_v];
    }

    fn int_load_lumped_mass_md(&self, off_v: usize, md: &mut DVector<f64>, _err: &mut f64, c: f64) {
        md[off_v] += c * self.inertia;
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
        if let Some(variables) = self.variables_in(descriptor) {
            variables.mass[(0, 0)] = self.inertia;
            variables.qb[0] = v[off_v];
            variables.fb[0] = r[off_v];
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
            v[off_v] = variables.qb[0];
        }
    }

    fn inject_variables(&mut self, descriptor: &mut SystemDescriptor) {
        let mut variables = Variables::with_diagonal_mass(1, self.inertia);
        variables.active = !self.fixed;
        self.variables = Some(descriptor.insert_variables(variables));
    }

    fn variables_fb_reset(&self, descriptor: &mut SystemDescriptor) {
        if let Some(variables) = self.variables_in(descriptor) {
            variables.fb.fill(0.0);
            variables.mass[(0, 0)] = self.inertia;
            variables.active = !self.fixed;
        }
    }

    fn variables_fb_load_forces(
        &self,
        _items: &Items,
        descriptor: &mut SystemDescriptor,
        factor: f64,
    ) {
        if let Some(variables) = self.variables_in(descriptor) {
            variables.fb[0] += factor * self.applied_torque;
        }
    }

    fn variables_qb_load_speed(&self, descriptor: &mut SystemDescriptor) {
        if let Some(variables) = self.variables_in(descriptor) {
            variables.qb[0] = self.speed;
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
        let old_speed = self.speed;
        self.speed = variables.qb[0];
        if step != 0.0 {
            self.acceleration = (self.speed - old_speed) / step;
        }
    }

    fn variables_qb_increment_position(&mut self, step: f64) {
        if !self.fixed {
            self.angle += self.speed * step;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    const TOL: f64 = 1e-12;

    #[test]
    fn test_invalid_inertia() {
        assert_eq!(Shaft::new(0.0).unwrap_err(), ShaftErrors::InvalidInertia(0.0));
        assert!(Shaft::new(-2.0).is_err());
        assert!(Shaft::new(f64::INFINITY).is_err());
    }

    #[test]
    fn test_gather_scatter() {
        let mut shaft = Shaft::new(2.0).unwrap().with_angle(0.3).with_speed(-1.5);
        let mut x = State::zeros(3);
        let mut v = StateDelta::zeros(3);
        let mut t = 0.0;
        shaft.int_state_gather(2, &mut x, 1, &mut v, &mut t);
        assert_abs_diff_eq!(x[2], 0.3, epsilon = TOL);
        assert_abs_diff_eq!(v[1], -1.5, epsilon = TOL);

        x[2] = 1.0;
        v[1] = 4.0;
        shaft.int_state_scatter(2, &x, 1, &v, 0.0);
        assert_abs_diff_eq!(shaft.angle, 1.0, epsilon = TOL);
        assert_abs_diff_eq!(shaft.speed, 4.0, epsilon = TOL);
    }

    #[test]
    fn test_mass_residual() {
        let shaft = Shaft::new(3.0).unwrap();
        let w = DVector::from_vec(vec![0.0, 2.0]);
        let mut r = DVector::zeros(2);
        shaft.int_load_residual_mv(1, &mut r, &w, 0.5);
        assert_abs_diff_eq!(r[1], 3.0, epsilon = TOL);

        let mut md = DVector::zeros(2);
        let mut err = 0.0;
        shaft.int_load_lumped_mass_md(1, &mut md, &mut err, 1.0);
        assert_abs_diff_eq!(md[1], 3.0, epsilon = TOL);
        assert_abs_diff_eq!(err, 0.0, epsilon = TOL);
    }

    #[test]
    fn test_transform_is_rotation_about_x() {
        let shaft = Shaft::new(1.0).unwrap().with_angle(0.7);
        let t = shaft.transform();
        assert_abs_diff_eq!(t.translation, nalgebra::Vector3::zeros(), epsilon = TOL);
        assert_abs_diff_eq!(t.rotation.angle(), 0.7, epsilon = TOL);
    }
}
