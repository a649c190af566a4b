use super::{ShaftsDrive, ShaftsMotor, bind_shafts};
use crate::{
    archive::Archivable,
    link::{Link, LinkBase, LinkErrors},
    solver::{PhysicsItem, descriptor::SystemDescriptor},
    system::{Items, ShaftHandle},
};
use functions::{FunctionModel, MotionFunction};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShaftsMotorAngleArchive {
    pub name: String,
    pub angle_function: MotionFunction,
    pub angle_offset: f64,
}

/// Imposes the relative angle `angle1 - angle2 = f(t) + angle_offset` between two shafts.
#[derive(Debug, Clone)]
pub struct ShaftsMotorAngle {
    base: LinkBase,
    angle_function: MotionFunction,
    angle_offset: f64,
    drive: ShaftsDrive,
}

impl Default for ShaftsMotorAngle {
    fn default() -> Self {
        Self {
            base: LinkBase::default(),
            angle_function: MotionFunction::constant(0.0),
            angle_offset: 0.0,
            drive: ShaftsDrive::default(),
        }
    }
}

impl ShaftsMotorAngle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.base.name = name.to_string();
        self
    }

    pub fn with_angle_function(mut self, f: impl Into<MotionFunction>) -> Self {
        self.angle_function = f.into();
        self
    }

    pub fn with_angle_offset(mut self, angle_offset: f64) -> Self {
        self.angle_offset = angle_offset;
        self
    }

    pub fn initialize(
        &mut self,
        items: &Items,
        shaft1: ShaftHandle,
        shaft2: ShaftHandle,
    ) -> Result<(), LinkErrors> {
        bind_shafts(&mut self.base, items, shaft1, shaft2)?;
        self.drive.reset(&mut self.base);
        Ok(())
    }

    pub fn angle_function(&self) -> &MotionFunction {
        &self.angle_function
    }

    pub fn set_angle_function(&mut self, f: impl Into<MotionFunction>) {
        self.angle_function = f.into();
    }

    pub fn angle_offset(&self) -> f64 {
        self.angle_offset
    }

    pub fn set_angle_offset(&mut self, angle_offset: f64) {
        self.angle_offset = angle_offset;
    }

    /// `angle1 - angle2 - f(t) - angle_offset` as of the last update.
    pub fn violation(&self) -> f64 {
        self.drive.violation()
    }

    fn constraint_ct(&self) -> f64 {
        -self.angle_function.derivative(self.base.time())
    }
}

impl Link for ShaftsMotorAngle {
    fn base(&self) -> &LinkBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut LinkBase {
        &mut self.base
    }

    fn num_affected_coords(&self) -> usize {
        2
    }

    fn update(&mut self, items: &Items, t: f64, _update_assets: bool) {
        self.update_time(t);
        self.angle_function.update(t);
        let violation =
            self.motor_angle(items) - self.angle_function.value(t) - self.angle_offset;
        self.drive.set_violation(violation);
    }
}

impl ShaftsMotor for ShaftsMotorAngle {
    fn motor_torque(&self) -> f64 {
        self.drive.torque()
    }
}

impl PhysicsItem for ShaftsMotorAngle {
    fn n_constraints(&self) -> usize {
        1
    }

    fn int_state_gather_reactions(&self, off_l: usize, l: &mut DVector<f64>) {
        self.drive.gather_reactions(off_l, l);
    }

    fn int_state_scatter_reactions(&mut self, off_l: usize, l: &DVector<f64>) {
        self.drive.scatter_reactions(&mut self.base, off_l, l);
    }

    fn int_load_residual_cql(
        &self,
        items: &Items,
        off_l: usize,
        r: &mut DVector<f64>,
        l: &DVector<f64>,
        c: f64,
    ) {
        self.drive.load_residual_cql(&self.base, items, off_l, r, l, c);
    }

    fn int_load_constraint_c(
        &self,
        off_l: usize,
        qc: &mut DVector<f64>,
        c: f64,
        do_clamp: bool,
        recovery_clamp: f64,
    ) {
        self.drive
            .load_constraint_c(off_l, qc, c, do_clamp, recovery_clamp);
    }

    fn int_load_constraint_ct(&self, off_l: usize, qc: &mut DVector<f64>, c: f64) {
        qc[off_l] += c * self.constraint_ct();
    }

    fn int_to_descriptor(
        &self,
        descriptor: &mut SystemDescriptor,
        _off_v: usize,
        _v: &DVector<f64>,
        _r: &DVector<f64>,
        off_l: usize,
        l: &DVector<f64>,
        qc: &DVector<f64>,
    ) {
        self.drive.row_to_descriptor(descriptor, off_l, l, qc);
    }

    fn int_from_descriptor(
        &self,
        descriptor: &SystemDescriptor,
        _off_v: usize,
        _v: &mut DVector<f64>,
        off_l: usize,
        l: &mut DVector<f64>,
    ) {
        self.drive.row_from_descriptor(descriptor, off_l, l);
    }

    fn inject_constraints(&mut self, items: &Items, descriptor: &mut SystemDescriptor) {
        self.drive.inject(&self.base, items, descriptor);
    }

    fn constraints_bi_reset(&self, descriptor: &mut SystemDescriptor) {
        self.drive.bi_reset(descriptor);
    }

    fn constraints_bi_load_c(
        &self,
        descriptor: &mut SystemDescriptor,
        factor: f64,
        recovery_clamp: f64,
        do_clamp: bool,
    ) {
        self.drive
            .bi_load_c(descriptor, factor, recovery_clamp, do_clamp);
    }

    fn constraints_bi_load_ct(&self, descriptor: &mut SystemDescriptor, factor: f64) {
        self.drive.bi_add(descriptor, factor * self.constraint_ct());
    }

    fn constraints_load_jacobians(&self, descriptor: &mut SystemDescriptor) {
        self.drive.load_jacobians(descriptor);
    }

    fn constraints_fetch_react(&mut self, descriptor: &SystemDescriptor, factor: f64) {
        self.drive.fetch_react(&mut self.base, descriptor, factor);
    }
}

impl Archivable for ShaftsMotorAngle {
    const CLASS_NAME: &'static str = "ShaftsMotorAngle";
    const CLASS_VERSION: u32 = 0;
    type Data = ShaftsMotorAngleArchive;

    fn archive_data(&self) -> ShaftsMotorAngleArchive {
        ShaftsMotorAngleArchive {
            name: self.base.name.clone(),
            angle_function: self.angle_function.clone(),
            angle_offset: self.angle_offset,
        }
    }

    fn restore_data(&mut self, data: ShaftsMotorAngleArchive, _version: u32) {
        self.base.name = data.name;
        self.angle_function = data.angle_function;
        self.angle_offset = data.angle_offset;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        link::Links,
        shaft::Shaft,
        archive::ArchiveErrors,
        system::{LinkHandle, System, options::StepOptions},
    };
    use approx::assert_abs_diff_eq;
    use nalgebra::Vector3;
    const TOL: f64 = 1e-12;

    fn setup(
        motor: ShaftsMotorAngle,
        fixed2: bool,
    ) -> (System, ShaftHandle, ShaftHandle, LinkHandle) {
        let mut sys = System::new();
        let s1 = sys.add_shaft(Shaft::new(1.0).unwrap());
        let s2 = sys.add_shaft(Shaft::new(1.0).unwrap().with_fixed(fixed2));
        let mut motor = motor;
        motor.initialize(&sys.items(), s1, s2).unwrap();
        let h = sys.add_link(motor).unwrap();
        (sys, s1, s2, h)
    }

    fn motor(sys: &System, h: LinkHandle) -> &ShaftsMotorAngle {
        match sys.link(h) {
            Some(Links::ShaftsMotorAngle(m)) => m,
            other => panic!("expected an angle motor, got {other:?}"),
        }
    }

    #[test]
    fn test_ramp_is_tracked_with_offset() {
        let (mut sys, _, _, h) = setup(
            ShaftsMotorAngle::new()
                .with_angle_function(MotionFunction::ramp(0.0, 1.0))
                .with_angle_offset(0.2),
            true,
        );
        let options = StepOptions::new(0.01).unwrap();
        sys.do_step(&options).unwrap();
        assert_abs_diff_eq!(motor(&sys, h).motor_angle(&sys.items()), 0.21, epsilon = 1e-9);

        sys.run(&options, 10).unwrap();
        let m = motor(&sys, h);
        assert_abs_diff_eq!(m.motor_angle(&sys.items()), 0.31, epsilon = 1e-9);
        assert_abs_diff_eq!(m.motor_angle_dt(&sys.items()), 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(m.violation(), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_default_locks_shafts() {
        let (mut sys, s1, s2, h) = setup(ShaftsMotorAngle::new(), false);
        sys.shaft_mut(s1).unwrap().applied_torque = 2.0;
        sys.do_step(&StepOptions::new(0.01).unwrap()).unwrap();

        let m = motor(&sys, h);
        assert_abs_diff_eq!(sys.shaft(s1).unwrap().speed, 0.01, epsilon = TOL);
        assert_abs_diff_eq!(sys.shaft(s2).unwrap().speed, 0.01, epsilon = TOL);
        assert_abs_diff_eq!(m.motor_torque(), -1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(m.reaction2(), 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(m.react_torque2(), Vector3::new(1.0, 0.0, 0.0), epsilon = 1e-9);
    }

    #[test]
    fn test_archive_round_trip() {
        let saved = ShaftsMotorAngle::new()
            .with_name("servo")
            .with_angle_function(MotionFunction::poly(vec![0.0, 1.0, 0.5]))
            .with_angle_offset(-0.1);
        let mut restored = ShaftsMotorAngle::new();
        restored.archive_in(&saved.archive_out().unwrap()).unwrap();
        assert_eq!(restored.archive_data(), saved.archive_data());
        assert_eq!(restored.name(), "servo");
    }

    fn archive_with(function: &str) -> String {
        format!(
            "(class: \"ShaftsMotorAngle\", version: 0, data: (name: \"servo\", \
             angle_function: {function}, angle_offset: 0.0))"
        )
    }

    #[test]
    fn test_archive_with_invalid_function_is_rejected() {
        let mut restored = ShaftsMotorAngle::new().with_name("kept");
        for function in [
            "Table((times: [], values: []))",
            "Table((times: [0.0, 1.0], values: [1.0]))",
            "Table((times: [1.0, 0.0], values: [1.0, 2.0]))",
            "Sine((amplitude: 1.0, frequency: -2.0, phase: 0.0))",
        ] {
            assert!(matches!(
                restored.archive_in(&archive_with(function)),
                Err(ArchiveErrors::Ron(_))
            ));
        }
        // nothing was overwritten
        assert_eq!(restored.name(), "kept");
        assert_abs_diff_eq!(restored.angle_function().derivative(0.5), 0.0, epsilon = TOL);

        restored
            .archive_in(&archive_with("Table((times: [0.0, 1.0], values: [0.0, 2.0]))"))
            .unwrap();
        assert_eq!(restored.name(), "servo");
        assert_abs_diff_eq!(restored.angle_function().derivative(0.5), 2.0, epsilon = TOL);
    }

    #[test]
    fn test_reactions_default_to_equal_and_opposite() {
        let (mut sys, s1, _, h) = setup(ShaftsMotorAngle::new(), true);
        sys.shaft_mut(s1).unwrap().applied_torque = -4.0;
        sys.do_step(&StepOptions::new(0.01).unwrap()).unwrap();
        let m = motor(&sys, h);
        assert_abs_diff_eq!(m.motor_torque(), 4.0, epsilon = 1e-9);
        assert_abs_diff_eq!(m.react_torque1(), -m.react_torque2(), epsilon = TOL);
        assert_abs_diff_eq!(m.react_torque_body1(), Vector3::new(4.0, 0.0, 0.0), epsilon = 1e-9);
        assert_abs_diff_eq!(m.react_torque_body2(), Vector3::new(-4.0, 0.0, 0.0), epsilon = 1e-9);
        assert_abs_diff_eq!(m.react_force1(), Vector3::zeros(), epsilon = TOL);
        assert_abs_diff_eq!(m.react_force_body2(), Vector3::zeros(), epsilon = TOL);
    }
}
