pub mod distance;

use crate::{
    archive::{Archivable, ArchiveErrors},
    motor::{angle::ShaftsMotorAngle, speed::ShaftsMotorSpeed},
    solver::{
        Offsets, PhysicsItem,
        constraint::{ConstraintKey, ConstraintTwoGeneric},
        descriptor::SystemDescriptor,
    },
    system::{ItemHandle, Items},
};
use distance::LinkDistance;
use nalgebra::{DVector, Vector3};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use transforms::Transform;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum LinkErrors {
    #[error("the connected items belong to different systems")]
    DifferentSystems,
    #[error("{0} is not a live item of this system")]
    InvalidHandle(&'static str),
    #[error("link '{0}' has not been initialized")]
    NotInitialized(String),
    #[error("anchor points coincide so the link direction is undefined")]
    DegenerateDistance,
}

/// State common to every link: the two connected items and the cached reaction on item 2.
///
/// Only the name is persistent. Bindings and reactions are rebuilt by `initialize` and stepping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkBase {
    pub name: String,
    #[serde(skip)]
    body1: Option<ItemHandle>,
    #[serde(skip)]
    body2: Option<ItemHandle>,
    /// reaction force on item 2, in the link frame
    #[serde(skip)]
    pub(crate) react_force: Vector3<f64>,
    /// reaction torque on item 2, in the link frame
    #[serde(skip)]
    pub(crate) react_torque: Vector3<f64>,
    #[serde(skip)]
    time: f64,
    #[serde(skip)]
    pub(crate) offsets: Offsets,
}

impl LinkBase {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Binds the link to two live items of the system behind `items`.
    /// Nothing is modified on failure.
    pub fn bind(
        &mut self,
        items: &Items,
        body1: ItemHandle,
        body2: ItemHandle,
    ) -> Result<(), LinkErrors> {
        if body1.system() != body2.system() || body1.system() != items.system() {
            warn!(link = %self.name, "refusing to connect items of different systems");
            return Err(LinkErrors::DifferentSystems);
        }
        if !items.contains(body1) {
            warn!(link = %self.name, "item 1 is not in the system");
            return Err(LinkErrors::InvalidHandle("item 1"));
        }
        if !items.contains(body2) {
            warn!(link = %self.name, "item 2 is not in the system");
            return Err(LinkErrors::InvalidHandle("item 2"));
        }
        self.body1 = Some(body1);
        self.body2 = Some(body2);
        self.react_force = Vector3::zeros();
        self.react_torque = Vector3::zeros();
        debug!(link = %self.name, "link bound");
        Ok(())
    }

    pub fn body1(&self) -> Option<ItemHandle> {
        self.body1
    }

    pub fn body2(&self) -> Option<ItemHandle> {
        self.body2
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn offsets(&self) -> Offsets {
        self.offsets
    }
}

/// A constraint between two items.
///
/// Frames: `link_relative_coords` is the link frame expressed in the frame of item 2, and the
/// absolute link frame is always `item2_frame * link_relative_coords`.
///
/// Reactions: `react_force2`/`react_torque2` act on item 2 and are expressed in the link frame.
/// The `*1` getters act on item 1 in the link frame seen from item 1, and the `*_body*`
/// getters express the same reactions in each item's own frame, about its origin.
pub trait Link: PhysicsItem {
    fn base(&self) -> &LinkBase;
    fn base_mut(&mut self) -> &mut LinkBase;

    fn name(&self) -> &str {
        &self.base().name
    }

    fn body1(&self) -> Option<ItemHandle> {
        self.base().body1
    }

    fn body2(&self) -> Option<ItemHandle> {
        self.base().body2
    }

    fn is_initialized(&self) -> bool {
        self.body1().is_some() && self.body2().is_some()
    }

    /// Number of speed coordinates of the connected items this link touches.
    fn num_affected_coords(&self) -> usize {
        12
    }

    /// Link frame relative to item 2.
    fn link_relative_coords(&self) -> Transform {
        Transform::identity()
    }

    /// Link frame in absolute coordinates. An unbound link reports its relative frame.
    fn link_absolute_coords(&self, items: &Items) -> Transform {
        let body2 = self
            .body2()
            .and_then(|h| items.transform(h))
            .unwrap_or_default();
        body2 * self.link_relative_coords()
    }

    // The defaults below hold for links whose frame is aligned with both items and whose
    // reactions carry no moment arm, as with shaft motors. Links with anchors override them.

    fn react_force1(&self) -> Vector3<f64> {
        -self.react_force2()
    }

    fn react_torque1(&self) -> Vector3<f64> {
        -self.react_torque2()
    }

    fn react_force2(&self) -> Vector3<f64> {
        self.base().react_force
    }

    fn react_torque2(&self) -> Vector3<f64> {
        self.base().react_torque
    }

    fn react_force_body1(&self) -> Vector3<f64> {
        self.react_force1()
    }

    fn react_torque_body1(&self) -> Vector3<f64> {
        self.react_torque1()
    }

    fn react_force_body2(&self) -> Vector3<f64> {
        self.react_force2()
    }

    fn react_torque_body2(&self) -> Vector3<f64> {
        self.react_torque2()
    }

    fn time(&self) -> f64 {
        self.base().time
    }

    fn update_time(&mut self, t: f64) {
        self.base_mut().time = t;
    }

    /// Brings every time dependent quantity of the link to time `t`.
    fn update(&mut self, _items: &Items, t: f64, _update_assets: bool) {
        self.update_time(t);
    }

    /// `update` at the link's current time.
    fn update_current(&mut self, items: &Items, update_assets: bool) {
        let t = self.time();
        self.update(items, t, update_assets);
    }

    /// Notifies the link that an outer solver moved time from `t_prev` to `t`.
    fn updated_external_time(&mut self, _t_prev: f64, _t: f64) {}
}

/// A single scalar constraint row owned by a link, plus its registration in the descriptor.
#[derive(Debug, Clone)]
pub struct LinkRow {
    pub constraint: ConstraintTwoGeneric,
    key: Option<ConstraintKey>,
}

impl LinkRow {
    pub fn new(ndof_a: usize, ndof_b: usize) -> Self {
        Self {
            constraint: ConstraintTwoGeneric::new(ndof_a, ndof_b),
            key: None,
        }
    }

    /// `r += cq^T * s` at the speed offsets of the two bound items.
    pub fn add_jacobian_transposed_times_scalar(
        &self,
        base: &LinkBase,
        items: &Items,
        r: &mut DVector<f64>,
        s: f64,
    ) {
        let off_a = base.body1.and_then(|h| items.offset_v(h));
        let off_b = base.body2.and_then(|h| items.offset_v(h));
        if let (Some(off_a), Some(off_b)) = (off_a, off_b) {
            self.constraint
                .add_jacobian_transposed_times_scalar_into(r, off_a, off_b, s);
        }
    }

    pub fn inject(&mut self, base: &LinkBase, items: &Items, descriptor: &mut SystemDescriptor) {
        let a = base.body1.and_then(|h| items.variables(h));
        let b = base.body2.and_then(|h| items.variables(h));
        let (Some(a), Some(b)) = (a, b) else {
            warn!(link = %base.name, "connected items have no variables, row not injected");
            self.key = None;
            return;
        };
        let mut constraint = self.constraint.clone();
        constraint.set_variables(a, b);
        self.key = Some(descriptor.insert_constraint(constraint));
    }

    /// Copies jacobians, right hand side and warm start multiplier into the descriptor row.
    pub fn to_descriptor(&self, descriptor: &mut SystemDescriptor, b_i: f64, l_i: f64) {
        if let Some(row) = self.row_mut(descriptor) {
            row.cq_a.copy_from(&self.constraint.cq_a);
            row.cq_b.copy_from(&self.constraint.cq_b);
            row.b_i = b_i;
            row.l_i = l_i;
        }
    }

    pub fn reset_b(&self, descriptor: &mut SystemDescriptor) {
        if let Some(row) = self.row_mut(descriptor) {
            row.b_i = 0.0;
        }
    }

    pub fn add_b(&self, descriptor: &mut SystemDescriptor, value: f64) {
        if let Some(row) = self.row_mut(descriptor) {
            row.b_i += value;
        }
    }

    pub fn load_jacobians(&self, descriptor: &mut SystemDescriptor) {
        if let Some(row) = self.row_mut(descriptor) {
            row.cq_a.copy_from(&self.constraint.cq_a);
            row.cq_b.copy_from(&self.constraint.cq_b);
        }
    }

    /// Multiplier found by the last solve, 0.0 if the row is not registered.
    pub fn multiplier(&self, descriptor: &SystemDescriptor) -> f64 {
        self.key
            .and_then(|key| descriptor.constraint(key))
            .map_or(0.0, |row| row.l_i)
    }

    fn row_mut<'a>(
        &self,
        descriptor: &'a mut SystemDescriptor,
    ) -> Option<&'a mut ConstraintTwoGeneric> {
        descriptor.constraint_mut(self.key?)
    }
}

/// The closed set of links a system can hold.
#[derive(Debug, Clone)]
pub enum Links {
    Distance(LinkDistance),
    ShaftsMotorAngle(ShaftsMotorAngle),
    ShaftsMotorSpeed(ShaftsMotorSpeed),
}

impl Links {
    pub fn as_link(&self) -> &dyn Link {
        match self {
            Links::Distance(link) => link,
            Links::ShaftsMotorAngle(link) => link,
            Links::ShaftsMotorSpeed(link) => link,
        }
    }

    pub fn as_link_mut(&mut self) -> &mut dyn Link {
        match self {
            Links::Distance(link) => link,
            Links::ShaftsMotorAngle(link) => link,
            Links::ShaftsMotorSpeed(link) => link,
        }
    }

    pub fn as_item(&self) -> &dyn PhysicsItem {
        match self {
            Links::Distance(link) => link,
            Links::ShaftsMotorAngle(link) => link,
            Links::ShaftsMotorSpeed(link) => link,
        }
    }

    pub fn as_item_mut(&mut self) -> &mut dyn PhysicsItem {
        match self {
            Links::Distance(link) => link,
            Links::ShaftsMotorAngle(link) => link,
            Links::ShaftsMotorSpeed(link) => link,
        }
    }

    pub fn archive_out(&self) -> Result<String, ArchiveErrors> {
        match self {
            Links::Distance(link) => link.archive_out(),
            Links::ShaftsMotorAngle(link) => link.archive_out(),
            Links::ShaftsMotorSpeed(link) => link.archive_out(),
        }
    }

    pub fn archive_in(&mut self, s: &str) -> Result<(), ArchiveErrors> {
        match self {
            Links::Distance(link) => link.archive_in(s),
            Links::ShaftsMotorAngle(link) => link.archive_in(s),
            Links::ShaftsMotorSpeed(link) => link.archive_in(s),
        }
    }
}

impl From<LinkDistance> for Links {
    fn from(value: LinkDistance) -> Self {
        Links::Distance(value)
    }
}
impl From<ShaftsMotorAngle> for Links {
    fn from(value: ShaftsMotorAngle) -> Self {
        Links::ShaftsMotorAngle(value)
    }
}
impl From<ShaftsMotorSpeed> for Links {
    fn from(value: ShaftsMotorSpeed) -> Self {
        Links::ShaftsMotorSpeed(value)
    }
}
