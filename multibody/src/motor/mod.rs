pub mod angle;
pub mod speed;

use crate::{
    link::{Link, LinkBase, LinkErrors, LinkRow},
    shaft::Shaft,
    solver::{clamp_violation, descriptor::SystemDescriptor},
    system::{ItemHandle, Items, ShaftHandle},
};
use nalgebra::{DVector, Vector3};

pub(crate) fn bind_shafts(
    base: &mut LinkBase,
    items: &Items,
    shaft1: ShaftHandle,
    shaft2: ShaftHandle,
) -> Result<(), LinkErrors> {
    base.bind(items, ItemHandle::Shaft(shaft1), ItemHandle::Shaft(shaft2))
}

/// Constraint row shared by motors between two shafts.
///
/// The row reads `C = angle1 - angle2 - target` with `Cq = [1, -1]` and its multiplier is the
/// motor torque. Each motor supplies its own position error and `dC/dt`.
#[derive(Debug, Clone)]
pub(crate) struct ShaftsDrive {
    row: LinkRow,
    violation: f64,
    torque: f64,
}

impl Default for ShaftsDrive {
    fn default() -> Self {
        let mut row = LinkRow::new(1, 1);
        row.constraint.cq_a[0] = 1.0;
        row.constraint.cq_b[0] = -1.0;
        Self {
            row,
            violation: 0.0,
            torque: 0.0,
        }
    }
}

impl ShaftsDrive {
    pub fn torque(&self) -> f64 {
        self.torque
    }

    pub fn violation(&self) -> f64 {
        self.violation
    }

    pub fn set_violation(&mut self, violation: f64) {
        self.violation = violation;
    }

    /// Stores the torque and mirrors it on shaft 2 as the reaction in the link frame.
    pub fn set_torque(&mut self, base: &mut LinkBase, torque: f64) {
        self.torque = torque;
        base.react_force = Vector3::zeros();
        base.react_torque = Vector3::new(-torque, 0.0, 0.0);
    }

    pub fn reset(&mut self, base: &mut LinkBase) {
        self.violation = 0.0;
        self.set_torque(base, 0.0);
    }

    pub fn gather_reactions(&self, off_l: usize, l: &mut DVector<f64>) {
        l[off_l] = self.torque;
    }

    pub fn scatter_reactions(&mut self, base: &mut LinkBase, off_l: usize, l: &DVector<f64>) {
        self.set_torque(base, l[off_l]);
    }

    pub fn load_residual_cql(
        &self,
        base: &LinkBase,
        items: &Items,
        off_l: usize,
        r: &mut DVector<f64>,
        l: &DVector<f64>,
        c: f64,
    ) {
        self.row
            .add_jacobian_transposed_times_scalar(base, items, r, c * l[off_l]);
    }

    pub fn load_constraint_c(
        &self,
        off_l: usize,
        qc: &mut DVector<f64>,
        c: f64,
        do_clamp: bool,
        recovery_clamp: f64,
    ) {
        qc[off_l] += clamp_violation(c * self.violation, recovery_clamp, do_clamp);
    }

    pub fn row_to_descriptor(
        &self,
        descriptor: &mut SystemDescriptor,
        off_l: usize,
        l: &DVector<f64>,
        qc: &DVector<f64>,
    ) {
        self.row.to_descriptor(descriptor, qc[off_l], l[off_l]);
    }

    pub fn row_from_descriptor(
        &self,
        descriptor: &SystemDescriptor,
        off_l: usize,
        l: &mut DVector<f64>,
    ) {
        l[off_l] = self.row.multiplier(descriptor);
    }

    pub fn inject(&mut self, base: &LinkBase, items: &Items, descriptor: &mut SystemDescriptor) {
        self.row.inject(base, items, descriptor);
    }

    pub fn bi_reset(&self, descriptor: &mut SystemDescriptor) {
        self.row.reset_b(descriptor);
    }

    pub fn bi_load_c(
        &self,
        descriptor: &mut SystemDescriptor,
        factor: f64,
        recovery_clamp: f64,
        do_clamp: bool,
    ) {
        let value = clamp_violation(factor * self.violation, recovery_clamp, do_clamp);
        self.row.add_b(descriptor, value);
    }

    /// `b_i += value`, where the caller has already scaled `dC/dt`.
    pub fn bi_add(&self, descriptor: &mut SystemDescriptor, value: f64) {
        self.row.add_b(descriptor, value);
    }

    pub fn load_jacobians(&self, descriptor: &mut SystemDescriptor) {
        self.row.load_jacobians(descriptor);
    }

    pub fn fetch_react(&mut self, base: &mut LinkBase, descriptor: &SystemDescriptor, factor: f64) {
        let torque = self.row.multiplier(descriptor) * factor;
        self.set_torque(base, torque);
    }
}

/// Queries common to motors acting between two shafts.
///
/// The motor torque acts positively on shaft 1 and negatively on shaft 2.
pub trait ShaftsMotor: Link {
    /// Torque applied by the motor in the last step, 0.0 before the first step.
    fn motor_torque(&self) -> f64;

    fn shafts<'a>(&self, items: &'a Items) -> Option<(&'a Shaft, &'a Shaft)> {
        match (self.body1(), self.body2()) {
            (Some(ItemHandle::Shaft(h1)), Some(ItemHandle::Shaft(h2))) => {
                Some((items.shaft(h1)?, items.shaft(h2)?))
            }
            _ => None,
        }
    }

    /// Relative angle `angle1 - angle2`.
    fn motor_angle(&self, items: &Items) -> f64 {
        self.shafts(items).map_or(0.0, |(s1, s2)| s1.angle - s2.angle)
    }

    fn motor_angle_dt(&self, items: &Items) -> f64 {
        self.shafts(items).map_or(0.0, |(s1, s2)| s1.speed - s2.speed)
    }

    fn motor_angle_dtdt(&self, items: &Items) -> f64 {
        self.shafts(items)
            .map_or(0.0, |(s1, s2)| s1.acceleration - s2.acceleration)
    }

    fn reaction1(&self) -> f64 {
        self.motor_torque()
    }

    fn reaction2(&self) -> f64 {
        -self.motor_torque()
    }
}
