use super::{ShaftsDrive, ShaftsMotor, bind_shafts};
use crate::{
    archive::Archivable,
    link::{Link, LinkBase, LinkErrors},
    solver::{
        PhysicsItem, State, StateDelta,
        descriptor::SystemDescriptor,
        variables::{Variables, VariablesKey},
    },
    system::{Items, ShaftHandle},
};
use functions::{FunctionModel, MotionFunction};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Persistent part of a `ShaftsMotorSpeed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShaftsMotorSpeedArchive {
    pub name: String,
    pub speed_function: MotionFunction,
    pub angle_offset: f64,
    pub avoid_angle_drift: bool,
}

/// Imposes the relative speed `speed1 - speed2 = w(t)` between two shafts.
///
/// With drift avoidance on, the motor also integrates the target angle in an auxiliary
/// state `aux_angle` and closes the constraint on position, so the relative angle tracks
/// `angle_offset + ∫w dt` without accumulating error.
/// With it off, only the speed is imposed.
///
/// The torque the motor applies is `motor_torque()`, positive on shaft 1, negative on shaft 2.
#[derive(Debug, Clone)]
pub struct ShaftsMotorSpeed {
    base: LinkBase,
    speed_function: MotionFunction,
    angle_offset: f64,
    avoid_angle_drift: bool,
    aux_angle: f64,
    aux_dt: f64,
    aux_dtdt: f64,
    aux_variables: Option<VariablesKey>,
    /// position error is 0.0 when drift avoidance is off
    drive: ShaftsDrive,
}

impl Default for ShaftsMotorSpeed {
    fn default() -> Self {
        Self {
            base: LinkBase::default(),
            speed_function: MotionFunction::default(),
            angle_offset: 0.0,
            avoid_angle_drift: true,
            aux_angle: 0.0,
            aux_dt: 0.0,
            aux_dtdt: 0.0,
            aux_variables: None,
            drive: ShaftsDrive::default(),
        }
    }
}

impl ShaftsMotorSpeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.base.name = name.to_string();
        self
    }

    pub fn with_speed_function(mut self, f: impl Into<MotionFunction>) -> Self {
        self.speed_function = f.into();
        self
    }

    pub fn with_angle_offset(mut self, angle_offset: f64) -> Self {
        self.angle_offset = angle_offset;
        self
    }

    pub fn with_avoid_angle_drift(mut self, avoid: bool) -> Self {
        self.avoid_angle_drift = avoid;
        self
    }

    /// Binds the motor to two shafts of the same system.
    /// On success the auxiliary angle restarts from the angle offset and the torque is cleared.
    pub fn initialize(
        &mut self,
        items: &Items,
        shaft1: ShaftHandle,
        shaft2: ShaftHandle,
    ) -> Result<(), LinkErrors> {
        bind_shafts(&mut self.base, items, shaft1, shaft2)?;
        self.aux_angle = self.angle_offset;
        self.aux_dt = 0.0;
        self.aux_dtdt = 0.0;
        self.drive.reset(&mut self.base);
        Ok(())
    }

    pub fn speed_function(&self) -> &MotionFunction {
        &self.speed_function
    }

    pub fn set_speed_function(&mut self, f: impl Into<MotionFunction>) {
        self.speed_function = f.into();
    }

    pub fn angle_offset(&self) -> f64 {
        self.angle_offset
    }

    /// Takes effect at the next `initialize`, which is when the auxiliary angle is reset.
    pub fn set_angle_offset(&mut self, angle_offset: f64) {
        self.angle_offset = angle_offset;
    }

    pub fn avoid_angle_drift(&self) -> bool {
        self.avoid_angle_drift
    }

    pub fn set_avoid_angle_drift(&mut self, avoid: bool) {
        self.avoid_angle_drift = avoid;
    }

    /// Integrated target angle.
    pub fn aux_angle(&self) -> f64 {
        self.aux_angle
    }

    /// Target speed as of the last update.
    pub fn aux_speed(&self) -> f64 {
        self.aux_dt
    }

    /// Target acceleration as of the last update. Between a solve and the following update
    /// it holds the acceleration estimated by the timestepper.
    pub fn aux_acceleration(&self) -> f64 {
        self.aux_dtdt
    }

    /// `dC/dt = -w(t)`
    fn constraint_ct(&self) -> f64 {
        -self.speed_function.value(self.base.time())
    }

    fn aux_variables_in<'a>(
        &self,
        descriptor: &'a mut SystemDescriptor,
    ) -> Option<&'a mut Variables> {
        descriptor.variables_mut(self.aux_variables?)
    }
}

impl Link for ShaftsMotorSpeed {
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
        self.speed_function.update(t);
        if self.avoid_angle_drift {
            self.aux_dt = self.speed_function.value(t);
            self.aux_dtdt = self.speed_function.derivative(t);
            let violation = self.motor_angle(items) - self.aux_angle;
            self.drive.set_violation(violation);
        } else {
            self.aux_dt = 0.0;
            self.aux_dtdt = 0.0;
            self.drive.set_violation(0.0);
        }
    }
}

impl ShaftsMotor for ShaftsMotorSpeed {
    fn motor_torque(&self) -> f64 {
        self.drive.torque()
    }
}

impl PhysicsItem for ShaftsMotorSpeed {
    fn n_coords_pos(&self) -> usize {
        1
    }
    fn n_coords_vel(&self) -> usize {
        1
    }
    fn n_constraints(&self) -> usize {
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
        x[off_x] = self.aux_angle;
        v[off_v] = self.aux_dt;
    }

    fn int_state_scatter(
        &mut self,
        off_x: usize,
        x: &State,
        off_v: usize,
        v: &StateDelta,
        _t: f64,
    ) {
        self.aux_angle = x[off_x];
        self.aux_dt = v[off_v];
    }

    fn int_state_gather_acceleration(&self, off_a: usize, a: &mut StateDelta) {
        a[off_a] = self.aux_dtdt;
    }

    fn int_state_scatter_acceleration(&mut self, off_a: usize, a: &StateDelta) {
        self.aux_dtdt = a[off_a];
    }

    fn int_state_gather_reactions(&self, off_l: usize, l: &mut DVector<f64>) {
        self.drive.gather_reactions(off_l, l);
    }

    fn int_state_scatter_reactions(&mut self, off_l: usize, l: &DVector<f64>) {
        self.drive.scatter_reactions(&mut self.base, off_l, l);
    }

    // the auxiliary state is unforced: its speed is prescribed in update()

    fn int_load_residual_mv(&self, off_v: usize, r: &mut DVector<f64>, w: &DVector<f64>, c: f64) {
        r[off_v] += c * w[off_v];
    }

    fn int_load_lumped_mass_md(&self, off_v: usize, md: &mut DVector<f64>, _err: &mut f64, c: f64) {
        md[off_v] += c;
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
        off_v: usize,
        v: &StateDelta,
        r: &DVector<f64>,
        off_l: usize,
        l: &DVector<f64>,
        qc: &DVector<f64>,
    ) {
        if let Some(variables) = self.aux_variables_in(descriptor) {
            variables.qb[0] = v[off_v];
            variables.fb[0] = r[off_v];
        }
        self.drive.row_to_descriptor(descriptor, off_l, l, qc);
    }

    fn int_from_descriptor(
        &self,
        descriptor: &SystemDescriptor,
        off_v: usize,
        v: &mut StateDelta,
        off_l: usize,
        l: &mut DVector<f64>,
    ) {
        if let Some(variables) = self.aux_variables.and_then(|key| descriptor.variables(key)) {
            v[off_v] = variables.qb[0];
        }
        self.drive.row_from_descriptor(descriptor, off_l, l);
    }

    fn inject_variables(&mut self, descriptor: &mut SystemDescriptor) {
        let key = descriptor.insert_variables(Variables::with_diagonal_mass(1, 1.0));
        self.aux_variables = Some(key);
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

    fn variables_fb_reset(&self, descriptor: &mut SystemDescriptor) {
        if let Some(variables) = self.aux_variables_in(descriptor) {
            variables.fb.fill(0.0);
        }
    }

    fn variables_qb_load_speed(&self, descriptor: &mut SystemDescriptor) {
        if let Some(variables) = self.aux_variables_in(descriptor) {
            variables.qb[0] = self.aux_dt;
        }
    }

    fn variables_fb_increment_mq(&self, descriptor: &mut SystemDescriptor) {
        if let Some(variables) = self.aux_variables_in(descriptor) {
            variables.compute_mass_times_qb_into_fb();
        }
    }

    fn variables_qb_set_speed(&mut self, descriptor: &SystemDescriptor, step: f64) {
        let Some(variables) = self.aux_variables.and_then(|key| descriptor.variables(key)) else {
            return;
        };
        let old_dt = self.aux_dt;
        self.aux_dt = variables.qb[0];
        if step != 0.0 {
            self.aux_dtdt = (self.aux_dt - old_dt) / step;
        }
    }

    fn variables_qb_increment_position(&mut self, step: f64) {
        self.aux_angle += self.aux_dt * step;
    }
}

impl Archivable for ShaftsMotorSpeed {
    const CLASS_NAME: &'static str = "ShaftsMotorSpeed";
    const CLASS_VERSION: u32 = 0;
    type Data = ShaftsMotorSpeedArchive;

    fn archive_data(&self) -> ShaftsMotorSpeedArchive {
        ShaftsMotorSpeedArchive {
            name: self.base.name.clone(),
            speed_function: self.speed_function.clone(),
            angle_offset: self.angle_offset,
            avoid_angle_drift: self.avoid_angle_drift,
        }
    }

    fn restore_data(&mut self, data: ShaftsMotorSpeedArchive, _version: u32) {
        self.base.name = data.name;
        self.speed_function = data.speed_function;
        self.angle_offset = data.angle_offset;
        self.avoid_angle_drift = data.avoid_angle_drift;
        debug!(link = %self.base.name, "speed motor restored");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        link::{Link, Links},
        shaft::Shaft,
        solver::timestepper::{Integrable, Timestepper},
        system::{LinkHandle, System, options::StepOptions},
    };
    use approx::assert_abs_diff_eq;
    use nalgebra::Vector3;
    const TOL: f64 = 1e-12;

    fn two_shafts(j1: f64, j2: f64, fixed2: bool) -> (System, ShaftHandle, ShaftHandle) {
        let mut sys = System::new();
        let s1 = sys.add_shaft(Shaft::new(j1).unwrap().with_name("s1"));
        let s2 = sys.add_shaft(Shaft::new(j2).unwrap().with_name("s2").with_fixed(fixed2));
        (sys, s1, s2)
    }

    fn add_motor(
        sys: &mut System,
        mut motor: ShaftsMotorSpeed,
        s1: ShaftHandle,
        s2: ShaftHandle,
    ) -> LinkHandle {
        motor.initialize(&sys.items(), s1, s2).unwrap();
        sys.add_link(motor).unwrap()
    }

    fn motor(sys: &System, h: LinkHandle) -> &ShaftsMotorSpeed {
        match sys.link(h) {
            Some(Links::ShaftsMotorSpeed(m)) => m,
            other => panic!("expected a speed motor, got {other:?}"),
        }
    }

    #[test]
    fn test_defaults() {
        let m = ShaftsMotorSpeed::new();
        assert_abs_diff_eq!(m.speed_function().value(0.0), 1.0, epsilon = TOL);
        assert_abs_diff_eq!(m.speed_function().value(42.0), 1.0, epsilon = TOL);
        assert_eq!(m.angle_offset(), 0.0);
        assert!(m.avoid_angle_drift());
        assert_eq!(m.motor_torque(), 0.0);
        assert!(!m.is_initialized());
        assert_eq!(m.num_affected_coords(), 2);
        assert_eq!(m.n_coords_pos(), 1);
        assert_eq!(m.n_coords_vel(), 1);
        assert_eq!(m.n_constraints(), 1);
    }

    #[test]
    fn test_initialize_resets_aux_state() {
        let (sys, s1, s2) = two_shafts(1.0, 1.0, false);
        let mut m = ShaftsMotorSpeed::new().with_angle_offset(0.4);
        m.initialize(&sys.items(), s1, s2).unwrap();
        assert!(m.is_initialized());
        assert_abs_diff_eq!(m.aux_angle(), 0.4, epsilon = TOL);
        assert_abs_diff_eq!(m.aux_speed(), 0.0, epsilon = TOL);
        assert_eq!(m.motor_torque(), 0.0);
    }

    #[test]
    fn test_initialize_rejects_other_system() {
        let (sys_a, s1, _) = two_shafts(1.0, 1.0, false);
        let (_sys_b, _, s2) = two_shafts(1.0, 1.0, false);
        let mut m = ShaftsMotorSpeed::new();
        assert_eq!(
            m.initialize(&sys_a.items(), s1, s2),
            Err(LinkErrors::DifferentSystems)
        );
        assert!(!m.is_initialized());
        assert!(m.body1().is_none());
        assert!(m.body2().is_none());
    }

    #[test]
    fn test_initialize_rejects_removed_shaft() {
        let (mut sys, s1, s2) = two_shafts(1.0, 1.0, false);
        sys.remove_shaft(s2);
        let mut m = ShaftsMotorSpeed::new();
        assert_eq!(
            m.initialize(&sys.items(), s1, s2),
            Err(LinkErrors::InvalidHandle("item 2"))
        );
        assert!(!m.is_initialized());
    }

    #[test]
    fn test_first_step_sign() {
        // shaft 1 driven at 2 rad/s against a fixed shaft 2
        let (mut sys, s1, s2) = two_shafts(1.0, 1.0, true);
        let h = add_motor(
            &mut sys,
            ShaftsMotorSpeed::new().with_speed_function(MotionFunction::constant(2.0)),
            s1,
            s2,
        );
        let options = StepOptions::new(0.01).unwrap();
        sys.do_step(&options).unwrap();

        let m = motor(&sys, h);
        let items = sys.items();
        assert_abs_diff_eq!(sys.shaft(s1).unwrap().speed, 2.0, epsilon = TOL);
        assert_abs_diff_eq!(m.motor_angle(&items), 0.02, epsilon = TOL);
        assert_abs_diff_eq!(m.motor_angle_dt(&items), 2.0, epsilon = TOL);
        assert_abs_diff_eq!(m.motor_torque(), 200.0, epsilon = 1e-9);
        assert_abs_diff_eq!(m.reaction1(), 200.0, epsilon = 1e-9);
        assert_abs_diff_eq!(m.reaction2(), -200.0, epsilon = 1e-9);
        assert_abs_diff_eq!(
            m.react_torque_body1(),
            Vector3::new(200.0, 0.0, 0.0),
            epsilon = 1e-9
        );
        assert_abs_diff_eq!(
            m.react_torque_body2(),
            Vector3::new(-200.0, 0.0, 0.0),
            epsilon = 1e-9
        );
        assert_abs_diff_eq!(m.react_torque2(), m.react_torque_body2(), epsilon = TOL);
        assert_abs_diff_eq!(m.react_torque1(), m.react_torque_body1(), epsilon = TOL);
        assert_abs_diff_eq!(m.react_force2(), Vector3::zeros(), epsilon = TOL);
    }

    #[test]
    fn test_steady_state_tracking_both_signs() {
        for w0 in [3.0, -3.0] {
            let (mut sys, s1, s2) = two_shafts(1.0, 2.0, false);
            let h = add_motor(
                &mut sys,
                ShaftsMotorSpeed::new().with_speed_function(MotionFunction::constant(w0)),
                s1,
                s2,
            );
            let options = StepOptions::new(0.005).unwrap();
            sys.run(&options, 200).unwrap();

            let m = motor(&sys, h);
            let items = sys.items();
            assert_abs_diff_eq!(m.motor_angle_dt(&items), w0, epsilon = 1e-9);
            assert_abs_diff_eq!(m.motor_angle(&items), w0, epsilon = 1e-9);
            assert_abs_diff_eq!(m.aux_angle(), w0, epsilon = 1e-9);
            // no external torque: angular momentum stays zero
            let (a, b) = m.shafts(&items).unwrap();
            assert_abs_diff_eq!(a.speed + 2.0 * b.speed, 0.0, epsilon = 1e-9);
            assert_abs_diff_eq!(a.speed, 2.0 * w0 / 3.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_angle_offset_recovered_in_one_step() {
        let (mut sys, s1, s2) = two_shafts(1.0, 1.0, true);
        let h = add_motor(
            &mut sys,
            ShaftsMotorSpeed::new().with_angle_offset(0.3),
            s1,
            s2,
        );
        sys.do_step(&StepOptions::new(0.01).unwrap()).unwrap();
        let m = motor(&sys, h);
        assert_abs_diff_eq!(m.motor_angle(&sys.items()), 0.31, epsilon = 1e-9);
        assert_abs_diff_eq!(m.aux_angle(), 0.31, epsilon = 1e-9);
    }

    #[test]
    fn test_aux_angle_tracks_offset_plus_integral() {
        // offset 0.7, w0 = -1.5 over 37 steps of 0.01 s: 0.7 - 1.5 * 0.37
        for timestepper in [Timestepper::EulerImplicitLinearized, Timestepper::DescriptorImpulse] {
            let (mut sys, s1, s2) = two_shafts(1.0, 2.0, false);
            sys.shaft_mut(s1).unwrap().applied_torque = 0.3;
            let h = add_motor(
                &mut sys,
                ShaftsMotorSpeed::new()
                    .with_speed_function(MotionFunction::constant(-1.5))
                    .with_angle_offset(0.7),
                s1,
                s2,
            );
            let options = StepOptions::new(0.01).unwrap().with_timestepper(timestepper);
            sys.run(&options, 37).unwrap();

            let m = motor(&sys, h);
            let items = sys.items();
            assert_abs_diff_eq!(m.aux_angle(), 0.145, epsilon = 1e-9);
            assert_abs_diff_eq!(m.motor_angle(&items), 0.145, epsilon = 1e-9);
            assert_abs_diff_eq!(m.motor_angle_dt(&items), -1.5, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_acceleration_and_reactions_round_trip_at_offsets() {
        let mut m = ShaftsMotorSpeed::new();
        let a = DVector::from_vec(vec![0.0, 0.0, 0.0, -0.75]);
        m.int_state_scatter_acceleration(3, &a);
        assert_eq!(m.aux_acceleration(), -0.75);
        let mut a_back = DVector::zeros(4);
        m.int_state_gather_acceleration(3, &mut a_back);
        assert_abs_diff_eq!(a_back, a, epsilon = TOL);

        let l = DVector::from_vec(vec![9.0, 12.5]);
        m.int_state_scatter_reactions(1, &l);
        assert_eq!(m.motor_torque(), 12.5);
        assert_abs_diff_eq!(m.react_torque2(), Vector3::new(-12.5, 0.0, 0.0), epsilon = TOL);
        let mut l_back = DVector::zeros(2);
        m.int_state_gather_reactions(1, &mut l_back);
        assert_abs_diff_eq!(l_back, DVector::from_vec(vec![0.0, 12.5]), epsilon = TOL);
    }

    #[test]
    fn test_aux_variable_has_unit_lumped_mass() {
        let m = ShaftsMotorSpeed::new();
        let mut md = DVector::zeros(3);
        let mut err = 0.0;
        m.int_load_lumped_mass_md(2, &mut md, &mut err, 0.5);
        assert_abs_diff_eq!(md, DVector::from_vec(vec![0.0, 0.0, 0.5]), epsilon = TOL);
        assert_eq!(err, 0.0);

        let (mut sys, s1, s2) = two_shafts(2.0, 3.0, false);
        add_motor(&mut sys, ShaftsMotorSpeed::new(), s1, s2);
        sys.setup().unwrap();
        let mut md = DVector::zeros(sys.n_coords_v());
        let mut err = 0.0;
        sys.load_lumped_mass_md(&mut md, &mut err, 1.0);
        assert_abs_diff_eq!(md, DVector::from_vec(vec![2.0, 3.0, 1.0]), epsilon = TOL);
        assert_eq!(err, 0.0);
    }

    #[test]
    fn test_system_gathers_motor_state_after_step() {
        for timestepper in [Timestepper::EulerImplicitLinearized, Timestepper::DescriptorImpulse] {
            let (mut sys, s1, s2) = two_shafts(1.0, 1.0, true);
            let h = add_motor(
                &mut sys,
                ShaftsMotorSpeed::new().with_speed_function(MotionFunction::ramp(0.5, 2.0)),
                s1,
                s2,
            );
            let options = StepOptions::new(0.01).unwrap().with_timestepper(timestepper);
            sys.run(&options, 3).unwrap();

            let m = motor(&sys, h);
            // target speed and acceleration of the ramp at the current time
            assert_abs_diff_eq!(m.aux_speed(), 0.5 + 2.0 * sys.time(), epsilon = TOL);
            assert_abs_diff_eq!(m.aux_acceleration(), 2.0, epsilon = TOL);

            let mut l = DVector::zeros(Integrable::n_constraints(&sys));
            sys.state_gather_reactions(&mut l);
            assert_abs_diff_eq!(l[0], m.motor_torque(), epsilon = TOL);

            let mut a = DVector::zeros(sys.n_coords_v());
            sys.state_gather_acceleration(&mut a);
            assert_abs_diff_eq!(a[0], sys.shaft(s1).unwrap().acceleration, epsilon = TOL);
            assert_abs_diff_eq!(a[2], 2.0, epsilon = TOL);
        }
    }

    #[test]
    fn test_drift_avoidance_off_has_no_target_acceleration() {
        let (mut sys, s1, s2) = two_shafts(1.0, 1.0, true);
        let h = add_motor(
            &mut sys,
            ShaftsMotorSpeed::new()
                .with_speed_function(MotionFunction::ramp(0.5, 2.0))
                .with_avoid_angle_drift(false),
            s1,
            s2,
        );
        sys.run(&StepOptions::new(0.01).unwrap(), 2).unwrap();
        assert_eq!(motor(&sys, h).aux_acceleration(), 0.0);
    }

    #[test]
    fn test_recovery_is_clamped() {
        let (mut sys, s1, s2) = two_shafts(1.0, 1.0, true);
        let h = add_motor(
            &mut sys,
            ShaftsMotorSpeed::new().with_angle_offset(0.3),
            s1,
            s2,
        );
        let options = StepOptions::new(0.01)
            .unwrap()
            .with_clamping(true)
            .with_recovery_clamp(0.5)
            .unwrap();
        sys.do_step(&options).unwrap();
        let m = motor(&sys, h);
        // w0 = 1 plus at most 0.5 of correction speed
        assert_abs_diff_eq!(m.motor_angle_dt(&sys.items()), 1.5, epsilon = 1e-9);
    }

    #[test]
    fn test_drift_avoidance_off_is_velocity_only() {
        let (mut sys, s1, s2) = two_shafts(1.0, 1.0, true);
        let h = add_motor(
            &mut sys,
            ShaftsMotorSpeed::new()
                .with_angle_offset(0.3)
                .with_avoid_angle_drift(false),
            s1,
            s2,
        );
        sys.run(&StepOptions::new(0.01).unwrap(), 50).unwrap();
        let m = motor(&sys, h);
        // the offset is never pulled in and the auxiliary angle never moves
        assert_abs_diff_eq!(m.motor_angle(&sys.items()), 0.5, epsilon = 1e-9);
        assert_abs_diff_eq!(m.motor_angle_dt(&sys.items()), 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(m.aux_angle(), 0.3, epsilon = TOL);
        assert_abs_diff_eq!(m.aux_speed(), 0.0, epsilon = TOL);
    }

    #[test]
    fn test_drift_avoidance_matches_when_consistent() {
        let run = |avoid: bool| {
            let (mut sys, s1, s2) = two_shafts(2.0, 0.5, false);
            sys.shaft_mut(s1).unwrap().applied_torque = 0.7;
            let f = MotionFunction::sine(1.5, 0.8, 0.2).unwrap();
            let h = add_motor(
                &mut sys,
                ShaftsMotorSpeed::new()
                    .with_speed_function(f)
                    .with_avoid_angle_drift(avoid),
                s1,
                s2,
            );
            sys.run(&StepOptions::new(0.002).unwrap(), 300).unwrap();
            let m = motor(&sys, h);
            (m.motor_angle(&sys.items()), m.motor_torque())
        };
        let (angle_on, torque_on) = run(true);
        let (angle_off, torque_off) = run(false);
        assert_abs_diff_eq!(angle_on, angle_off, epsilon = 1e-9);
        assert_abs_diff_eq!(torque_on, torque_off, epsilon = 1e-6);
    }

    #[test]
    fn test_time_varying_speed() {
        let f = MotionFunction::sine(2.0, 0.5, 0.0).unwrap();
        let (mut sys, s1, s2) = two_shafts(1.0, 1.0, false);
        let h = add_motor(
            &mut sys,
            ShaftsMotorSpeed::new().with_speed_function(f.clone()),
            s1,
            s2,
        );
        let options = StepOptions::new(0.01).unwrap();
        let mut integral = 0.0;
        for _ in 0..100 {
            let t = sys.time();
            sys.do_step(&options).unwrap();
            integral += 0.01 * f.value(t);
            let m = motor(&sys, h);
            assert_abs_diff_eq!(m.motor_angle_dt(&sys.items()), f.value(t), epsilon = 1e-9);
        }
        let m = motor(&sys, h);
        assert_abs_diff_eq!(m.motor_angle(&sys.items()), integral, epsilon = 1e-9);
        assert_abs_diff_eq!(m.aux_angle(), integral, epsilon = 1e-9);
    }

    #[test]
    fn test_motor_torque_balances_load() {
        let (mut sys, s1, s2) = two_shafts(1.0, 1.0, true);
        sys.shaft_mut(s1).unwrap().applied_torque = 5.0;
        let h = add_motor(&mut sys, ShaftsMotorSpeed::new(), s1, s2);
        sys.run(&StepOptions::new(0.01).unwrap(), 3).unwrap();
        assert_abs_diff_eq!(motor(&sys, h).motor_torque(), -5.0, epsilon = 1e-9);
    }

    #[test]
    fn test_link_frame_follows_shaft2() {
        let (mut sys, s1, s2) = two_shafts(1.0, 1.0, false);
        let h = add_motor(&mut sys, ShaftsMotorSpeed::new(), s1, s2);
        for angle in [0.0, 0.3, -2.0, 5.5] {
            sys.shaft_mut(s2).unwrap().angle = angle;
            let m = motor(&sys, h);
            let expected = sys.shaft(s2).unwrap().transform() * m.link_relative_coords();
            assert_abs_diff_eq!(m.link_absolute_coords(&sys.items()), expected, epsilon = TOL);
        }
    }

    #[test]
    fn test_both_timesteppers_agree() {
        let run = |timestepper: Timestepper| {
            let (mut sys, s1, s2) = two_shafts(1.0, 3.0, false);
            sys.shaft_mut(s2).unwrap().applied_torque = -0.4;
            let f = MotionFunction::ramp(0.5, 2.0);
            let h = add_motor(
                &mut sys,
                ShaftsMotorSpeed::new()
                    .with_speed_function(f)
                    .with_angle_offset(0.1),
                s1,
                s2,
            );
            let options = StepOptions::new(0.005).unwrap().with_timestepper(timestepper);
            sys.run(&options, 100).unwrap();
            let m = motor(&sys, h);
            (
                sys.shaft(s1).unwrap().angle,
                sys.shaft(s2).unwrap().speed,
                m.motor_torque(),
                m.aux_angle(),
            )
        };
        let a = run(Timestepper::EulerImplicitLinearized);
        let b = run(Timestepper::DescriptorImpulse);
        assert_abs_diff_eq!(a.0, b.0, epsilon = 1e-9);
        assert_abs_diff_eq!(a.1, b.1, epsilon = 1e-9);
        assert_abs_diff_eq!(a.2, b.2, epsilon = 1e-6);
        assert_abs_diff_eq!(a.3, b.3, epsilon = 1e-9);
    }

    #[test]
    fn test_archive_round_trip() {
        let saved = ShaftsMotorSpeed::new()
            .with_name("spindle")
            .with_speed_function(MotionFunction::sine(1.0, 2.0, 0.5).unwrap())
            .with_angle_offset(0.25)
            .with_avoid_angle_drift(false);
        let s = saved.archive_out().unwrap();

        let mut restored = ShaftsMotorSpeed::new();
        restored.archive_in(&s).unwrap();
        assert_eq!(restored.archive_data(), saved.archive_data());
        assert_eq!(restored.name(), "spindle");
        assert_eq!(restored.speed_function(), saved.speed_function());
        assert_eq!(restored.angle_offset(), 0.25);
        assert!(!restored.avoid_angle_drift());
    }

    #[test]
    fn test_archive_in_keeps_bindings() {
        let (sys, s1, s2) = two_shafts(1.0, 1.0, false);
        let mut m = ShaftsMotorSpeed::new();
        m.initialize(&sys.items(), s1, s2).unwrap();
        let s = ShaftsMotorSpeed::new().with_angle_offset(1.0).archive_out().unwrap();
        m.archive_in(&s).unwrap();
        assert!(m.is_initialized());
        assert_eq!(m.angle_offset(), 1.0);
    }

    #[test]
    fn test_archive_rejects_other_class() {
        let s = crate::motor::angle::ShaftsMotorAngle::new().archive_out().unwrap();
        let mut m = ShaftsMotorSpeed::new();
        assert!(matches!(
            m.archive_in(&s),
            Err(crate::archive::ArchiveErrors::ClassMismatch { .. })
        ));
    }

    #[test]
    fn test_clone_is_independent() {
        let original = ShaftsMotorSpeed::new().with_angle_offset(0.5);
        let mut copy = original.clone();
        copy.set_speed_function(MotionFunction::constant(-4.0));
        copy.set_angle_offset(0.0);
        assert_abs_diff_eq!(original.speed_function().value(0.0), 1.0, epsilon = TOL);
        assert_eq!(original.angle_offset(), 0.5);
        assert_abs_diff_eq!(copy.speed_function().value(0.0), -4.0, epsilon = TOL);
    }
}
