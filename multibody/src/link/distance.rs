use super::{Link, LinkBase, LinkErrors, LinkRow};
use crate::{
    archive::Archivable,
    body::Body,
    solver::{PhysicsItem, clamp_violation, descriptor::SystemDescriptor},
    system::{BodyHandle, ItemHandle, Items},
};
use nalgebra::{DVector, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use transforms::Transform;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkDistanceArchive {
    pub name: String,
    pub pos1: Vector3<f64>,
    pub pos2: Vector3<f64>,
    pub distance: f64,
}

/// Keeps two points, one on each body, at a fixed distance (a massless rod with ball ends).
///
/// The link frame sits on the body 2 anchor with its X axis pointing from anchor 2 to anchor 1.
/// A positive reaction pushes the anchors apart.
#[derive(Debug, Clone)]
pub struct LinkDistance {
    base: LinkBase,
    /// anchor on body 1, body 1 frame
    pos1: Vector3<f64>,
    /// anchor on body 2, body 2 frame
    pos2: Vector3<f64>,
    distance: f64,
    violation: f64,
    /// unit vector from anchor 2 to anchor 1, absolute frame
    direction: Vector3<f64>,
    /// anchor positions relative to each body origin, absolute frame
    arm1: Vector3<f64>,
    arm2: Vector3<f64>,
    rotation1: UnitQuaternion<f64>,
    rotation2: UnitQuaternion<f64>,
    react: f64,
    row: LinkRow,
}

impl Default for LinkDistance {
    fn default() -> Self {
        Self {
            base: LinkBase::default(),
            pos1: Vector3::zeros(),
            pos2: Vector3::zeros(),
            distance: 0.0,
            violation: 0.0,
            direction: Vector3::x(),
            arm1: Vector3::zeros(),
            arm2: Vector3::zeros(),
            rotation1: UnitQuaternion::identity(),
            rotation2: UnitQuaternion::identity(),
            react: 0.0,
            row: LinkRow::new(6, 6),
        }
    }
}

fn body<'a>(items: &'a Items, handle: Option<ItemHandle>) -> Option<&'a Body> {
    match handle? {
        ItemHandle::Body(h) => items.body(h),
        ItemHandle::Shaft(_) => None,
    }
}

impl LinkDistance {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.base.name = name.to_string();
        self
    }

    /// Binds the link to two bodies.
    ///
    /// Anchors are given in absolute coordinates, or in each body's frame when `pos_are_relative`.
    /// The imposed distance is the current anchor distance unless `distance` is given.
    #[allow(clippy::too_many_arguments)]
    pub fn initialize(
        &mut self,
        items: &Items,
        body1: BodyHandle,
        body2: BodyHandle,
        pos_are_relative: bool,
        pos1: Vector3<f64>,
        pos2: Vector3<f64>,
        distance: Option<f64>,
    ) -> Result<(), LinkErrors> {
        let mut base = self.base.clone();
        base.bind(items, ItemHandle::Body(body1), ItemHandle::Body(body2))?;
        let (Some(b1), Some(b2)) = (items.body(body1), items.body(body2)) else {
            return Err(LinkErrors::InvalidHandle("body"));
        };

        let (pos1, pos2) = if pos_are_relative {
            (pos1, pos2)
        } else {
            (b1.transform.point_to_local(&pos1), b2.transform.point_to_local(&pos2))
        };
        let current =
            (b1.transform.point_to_parent(&pos1) - b2.transform.point_to_parent(&pos2)).norm();
        if current < 1e-12 {
            return Err(LinkErrors::DegenerateDistance);
        }

        self.base = base;
        self.pos1 = pos1;
        self.pos2 = pos2;
        self.distance = distance.unwrap_or(current);
        self.refresh(items);
        self.set_react(0.0);
        Ok(())
    }

    pub fn imposed_distance(&self) -> f64 {
        self.distance
    }

    pub fn set_imposed_distance(&mut self, distance: f64) {
        self.distance = distance;
    }

    /// Anchor distance as of the last update.
    pub fn current_distance(&self) -> f64 {
        self.violation + self.distance
    }

    pub fn end_point1_rel(&self) -> Vector3<f64> {
        self.pos1
    }

    pub fn end_point2_rel(&self) -> Vector3<f64> {
        self.pos2
    }

    /// Signed force along the rod, positive when pushing the anchors apart.
    pub fn rod_force(&self) -> f64 {
        self.react
    }

    fn set_react(&mut self, react: f64) {
        self.react = react;
        self.base.react_force = Vector3::new(-react, 0.0, 0.0);
        self.base.react_torque = Vector3::zeros();
    }

    /// Recomputes the anchor geometry and the jacobian from the current body poses.
    fn refresh(&mut self, items: &Items) {
        let b1 = body(items, self.base.body1());
        let b2 = body(items, self.base.body2());
        let (Some(b1), Some(b2)) = (b1, b2) else {
            return;
        };
        let p1 = b1.transform.point_to_parent(&self.pos1);
        let p2 = b2.transform.point_to_parent(&self.pos2);
        let d = p1 - p2;
        let length = d.norm();
        // keep the last direction through a momentary coincidence
        if length > f64::EPSILON {
            self.direction = d / length;
        }
        self.violation = length - self.distance;
        self.arm1 = p1 - b1.position();
        self.arm2 = p2 - b2.position();
        self.rotation1 = b1.transform.rotation;
        self.rotation2 = b2.transform.rotation;

        let n = self.direction;
        let c = &mut self.row.constraint;
        c.cq_a.fixed_rows_mut::<3>(0).copy_from(&n);
        c.cq_a.fixed_rows_mut::<3>(3).copy_from(&self.arm1.cross(&n));
        c.cq_b.fixed_rows_mut::<3>(0).copy_from(&(-n));
        c.cq_b.fixed_rows_mut::<3>(3).copy_from(&(-self.arm2.cross(&n)));
    }
}

impl Link for LinkDistance {
    fn base(&self) -> &LinkBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut LinkBase {
        &mut self.base
    }

    fn link_relative_coords(&self) -> Transform {
        let local = self.rotation2.inverse() * self.direction;
        Transform::from_x_axis(self.pos2, &local)
            .unwrap_or_else(|| Transform::from_translation(self.pos2))
    }

    fn react_force1(&self) -> Vector3<f64> {
        Vector3::new(self.react, 0.0, 0.0)
    }

    fn react_torque1(&self) -> Vector3<f64> {
        Vector3::zeros()
    }

    fn react_force_body1(&self) -> Vector3<f64> {
        self.rotation1.inverse() * (self.direction * self.react)
    }

    fn react_torque_body1(&self) -> Vector3<f64> {
        self.rotation1.inverse() * self.arm1.cross(&(self.direction * self.react))
    }

    fn react_force_body2(&self) -> Vector3<f64> {
        self.rotation2.inverse() * (-self.direction * self.react)
    }

    fn react_torque_body2(&self) -> Vector3<f64> {
        self.rotation2.inverse() * self.arm2.cross(&(-self.direction * self.react))
    }

    fn update(&mut self, items: &Items, t: f64, _update_assets: bool) {
        self.update_time(t);
        self.refresh(items);
    }
}

impl PhysicsItem for LinkDistance {
    fn n_constraints(&self) -> usize {
        1
    }

    fn int_state_gather_reactions(&self, off_l: usize, l: &mut DVector<f64>) {
        l[off_l] = self.react;
    }

    fn int_state_scatter_reactions(&mut self, off_l: usize, l: &DVector<f64>) {
        self.set_react(l[off_l]);
    }

    fn int_load_residual_cql(
        &self,
        items: &Items,
        off_l: usize,
        r: &mut DVector<f64>,
        l: &DVector<f64>,
        c: f64,
    ) {
        self.row
            .add_jacobian_transposed_times_scalar(&self.base, items, r, c * l[off_l]);
    }

    fn int_load_constraint_c(
        &self,
        off_l: usize,
        qc: &mut DVector<f64>,
        c: f64,
        do_clamp: bool,
        recovery_clamp: f64,
    ) {
        qc[off_l] += clamp_violation(c * self.violation, recovery_clamp, do_clamp);
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
        self.row.to_descriptor(descriptor, qc[off_l], l[off_l]);
    }

    fn int_from_descriptor(
        &self,
        descriptor: &SystemDescriptor,
        _off_v: usize,
        _v: &mut DVector<f64>,
        off_l: usize,
        l: &mut DVector<f64>,
    ) {
        l[off_l] = self.row.multiplier(descriptor);
    }

    fn inject_constraints(&mut self, items: &Items, descriptor: &mut SystemDescriptor) {
        self.row.inject(&self.base, items, descriptor);
    }

    fn constraints_bi_reset(&self, descriptor: &mut SystemDescriptor) {
        self.row.reset_b(descriptor);
    }

    fn constraints_bi_load_c(
        &self,
        descriptor: &mut SystemDescriptor,
        factor: f64,
        recovery_clamp: f64,
        do_clamp: bool,
    ) {
        let value = clamp_violation(factor * self.violation, recovery_clamp, do_clamp);
        self.row.add_b(descriptor, value);
    }

    fn constraints_load_jacobians(&self, descriptor: &mut SystemDescriptor) {
        self.row.load_jacobians(descriptor);
    }

    fn constraints_fetch_react(&mut self, descriptor: &SystemDescriptor, factor: f64) {
        let react = self.row.multiplier(descriptor) * factor;
        self.set_react(react);
    }
}

impl Archivable for LinkDistance {
    const CLASS_NAME: &'static str = "LinkDistance";
    const CLASS_VERSION: u32 = 0;
    type Data = LinkDistanceArchive;

    fn archive_data(&self) -> LinkDistanceArchive {
        LinkDistanceArchive {
            name: self.base.name.clone(),
            pos1: self.pos1,
            pos2: self.pos2,
            distance: self.distance,
        }
    }

    fn restore_data(&mut self, data: LinkDistanceArchive, _version: u32) {
        self.base.name = data.name;
        self.pos1 = data.pos1;
        self.pos2 = data.pos2;
        self.distance = data.distance;
    }
}
