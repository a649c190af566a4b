pub mod arena;
pub mod options;

use crate::{
    MultibodyErrors,
    body::Body,
    link::{LinkErrors, Links},
    shaft::Shaft,
    solver::{
        Offsets, PhysicsItem, SolverErrors, State, StateDelta,
        descriptor::SystemDescriptor,
        timestepper::{Integrable, Timestepper, euler_implicit_linearized},
        variables::VariablesKey,
    },
};
use arena::{Arena, Index};
use nalgebra::{DVector, Vector3};
use options::StepOptions;
use std::{
    fmt,
    hash::{Hash, Hasher},
    marker::PhantomData,
    mem::take,
};
use thiserror::Error;
use tracing::{debug, trace};
use transforms::Transform;
use uuid::Uuid;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SystemErrors {
    #[error("handle belongs to another system")]
    ForeignHandle,
    #[error("link '{0}' refers to an item that is no longer in the system")]
    DanglingLink(String),
}

/// Identity of a system. Every handle carries the id of the system that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SystemId(Uuid);

impl SystemId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

/// Typed reference to an item owned by a system.
/// A handle stays valid until its item is removed, after which lookups return None.
pub struct Handle<T> {
    system: SystemId,
    index: Index,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    fn new(system: SystemId, index: Index) -> Self {
        Self {
            system,
            index,
            _marker: PhantomData,
        }
    }

    pub fn system(&self) -> SystemId {
        self.system
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.system == other.system && self.index == other.index
    }
}
impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.system.hash(state);
        self.index.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("system", &self.system)
            .field("index", &self.index)
            .finish()
    }
}

pub type BodyHandle = Handle<Body>;
pub type ShaftHandle = Handle<Shaft>;
pub type LinkHandle = Handle<Links>;

/// Any item a link can connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemHandle {
    Body(BodyHandle),
    Shaft(ShaftHandle),
}

impl ItemHandle {
    pub fn system(&self) -> SystemId {
        match self {
            ItemHandle::Body(h) => h.system(),
            ItemHandle::Shaft(h) => h.system(),
        }
    }
}

impl From<BodyHandle> for ItemHandle {
    fn from(value: BodyHandle) -> Self {
        ItemHandle::Body(value)
    }
}
impl From<ShaftHandle> for ItemHandle {
    fn from(value: ShaftHandle) -> Self {
        ItemHandle::Shaft(value)
    }
}

/// Read-only view of the items of one system, handed to links so they can
/// resolve their handles while the system mutates the links themselves.
#[derive(Clone, Copy)]
pub struct Items<'a> {
    system: SystemId,
    pub gravity: Vector3<f64>,
    bodies: &'a Arena<Body>,
    shafts: &'a Arena<Shaft>,
}

impl<'a> Items<'a> {
    pub fn system(&self) -> SystemId {
        self.system
    }

    pub fn body(&self, handle: BodyHandle) -> Option<&'a Body> {
        if handle.system != self.system {
            return None;
        }
        self.bodies.get(handle.index)
    }

    pub fn shaft(&self, handle: ShaftHandle) -> Option<&'a Shaft> {
        if handle.system != self.system {
            return None;
        }
        self.shafts.get(handle.index)
    }

    pub fn contains(&self, handle: ItemHandle) -> bool {
        match handle {
            ItemHandle::Body(h) => self.body(h).is_some(),
            ItemHandle::Shaft(h) => self.shaft(h).is_some(),
        }
    }

    /// Absolute frame of the item.
    pub fn transform(&self, handle: ItemHandle) -> Option<Transform> {
        match handle {
            ItemHandle::Body(h) => self.body(h).map(|b| b.transform),
            ItemHandle::Shaft(h) => self.shaft(h).map(|s| s.transform()),
        }
    }

    pub fn offset_v(&self, handle: ItemHandle) -> Option<usize> {
        match handle {
            ItemHandle::Body(h) => self.body(h).map(|b| b.offsets.v),
            ItemHandle::Shaft(h) => self.shaft(h).map(|s| s.offsets.v),
        }
    }

    pub fn variables(&self, handle: ItemHandle) -> Option<VariablesKey> {
        match handle {
            ItemHandle::Body(h) => self.body(h).and_then(|b| b.variables),
            ItemHandle::Shaft(h) => self.shaft(h).and_then(|s| s.variables),
        }
    }
}

/// Owns bodies, shafts and links and advances them in time.
#[derive(Debug)]
pub struct System {
    id: SystemId,
    time: f64,
    gravity: Vector3<f64>,
    bodies: Arena<Body>,
    shafts: Arena<Shaft>,
    links: Arena<Links>,
    descriptor: SystemDescriptor,
    n_coords_x: usize,
    n_coords_v: usize,
    n_constraints: usize,
    needs_setup: bool,
}

impl Default for System {
    fn default() -> Self {
        Self {
            id: SystemId::new(),
            time: 0.0,
            gravity: Vector3::zeros(),
            bodies: Arena::new(),
            shafts: Arena::new(),
            links: Arena::new(),
            descriptor: SystemDescriptor::new(),
            n_coords_x: 0,
            n_coords_v: 0,
            n_constraints: 0,
            needs_setup: true,
        }
    }
}

impl System {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_gravity(mut self, gravity: Vector3<f64>) -> Self {
        self.gravity = gravity;
        self
    }

    pub fn id(&self) -> SystemId {
        self.id
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn gravity(&self) -> Vector3<f64> {
        self.gravity
    }

    pub fn set_gravity(&mut self, gravity: Vector3<f64>) {
        self.gravity = gravity;
    }

    pub fn items(&self) -> Items<'_> {
        Items {
            system: self.id,
            gravity: self.gravity,
            bodies: &self.bodies,
            shafts: &self.shafts,
        }
    }

    pub fn add_body(&mut self, body: Body) -> BodyHandle {
        self.needs_setup = true;
        Handle::new(self.id, self.bodies.insert(body))
    }

    pub fn remove_body(&mut self, handle: BodyHandle) -> Option<Body> {
        if handle.system != self.id {
            return None;
        }
        self.needs_setup = true;
        self.bodies.remove(handle.index)
    }

    pub fn body(&self, handle: BodyHandle) -> Option<&Body> {
        self.items().body(handle)
    }

    pub fn body_mut(&mut self, handle: BodyHandle) -> Option<&mut Body> {
        if handle.system != self.id {
            return None;
        }
        self.bodies.get_mut(handle.index)
    }

    pub fn add_shaft(&mut self, shaft: Shaft) -> ShaftHandle {
        self.needs_setup = true;
        Handle::new(self.id, self.shafts.insert(shaft))
    }

    pub fn remove_shaft(&mut self, handle: ShaftHandle) -> Option<Shaft> {
        if handle.system != self.id {
            return None;
        }
        self.needs_setup = true;
        self.shafts.remove(handle.index)
    }

    pub fn shaft(&self, handle: ShaftHandle) -> Option<&Shaft> {
        self.items().shaft(handle)
    }

    pub fn shaft_mut(&mut self, handle: ShaftHandle) -> Option<&mut Shaft> {
        if handle.system != self.id {
            return None;
        }
        self.shafts.get_mut(handle.index)
    }

    /// Adds an initialized link whose items all live in this system.
    pub fn add_link(&mut self, link: impl Into<Links>) -> Result<LinkHandle, MultibodyErrors> {
        let mut link = link.into();
        {
            let l = link.as_link();
            let (Some(body1), Some(body2)) = (l.body1(), l.body2()) else {
                return Err(LinkErrors::NotInitialized(l.name().to_string()).into());
            };
            if body1.system() != self.id || body2.system() != self.id {
                return Err(SystemErrors::ForeignHandle.into());
            }
            let items = self.items();
            if !items.contains(body1) || !items.contains(body2) {
                return Err(SystemErrors::DanglingLink(l.name().to_string()).into());
            }
        }
        let items = Items {
            system: self.id,
            gravity: self.gravity,
            bodies: &self.bodies,
            shafts: &self.shafts,
        };
        link.as_link_mut().update(&items, self.time, false);
        self.needs_setup = true;
        Ok(Handle::new(self.id, self.links.insert(link)))
    }

    pub fn remove_link(&mut self, handle: LinkHandle) -> Option<Links> {
        if handle.system != self.id {
            return None;
        }
        self.needs_setup = true;
        self.links.remove(handle.index)
    }

    pub fn link(&self, handle: LinkHandle) -> Option<&Links> {
        if handle.system != self.id {
            return None;
        }
        self.links.get(handle.index)
    }

    /// Mutable access to a link. The link may be rebound, so the system is set up again
    /// before the next step.
    pub fn link_mut(&mut self, handle: LinkHandle) -> Option<&mut Links> {
        if handle.system != self.id {
            return None;
        }
        self.needs_setup = true;
        self.links.get_mut(handle.index)
    }

    pub fn n_bodies(&self) -> usize {
        self.bodies.len()
    }

    pub fn n_shafts(&self) -> usize {
        self.shafts.len()
    }

    pub fn n_links(&self) -> usize {
        self.links.len()
    }

    fn for_each_item(&self, mut f: impl FnMut(&dyn PhysicsItem, Offsets)) {
        for body in self.bodies.values() {
            f(body, body.offsets);
        }
        for shaft in self.shafts.values() {
            f(shaft, shaft.offsets);
        }
        for link in self.links.values() {
            f(link.as_item(), link.as_link().base().offsets());
        }
    }

    fn for_each_item_mut(&mut self, mut f: impl FnMut(&mut dyn PhysicsItem, Offsets)) {
        for body in self.bodies.values_mut() {
            let offsets = body.offsets;
            f(body, offsets);
        }
        for shaft in self.shafts.values_mut() {
            let offsets = shaft.offsets;
            f(shaft, offsets);
        }
        for link in self.links.values_mut() {
            let offsets = link.as_link().base().offsets();
            f(link.as_item_mut(), offsets);
        }
    }

    /// Checks every link binding, lays out the state vectors and rebuilds the descriptor.
    pub fn setup(&mut self) -> Result<(), MultibodyErrors> {
        let items = self.items();
        for link in self.links.values() {
            let link = link.as_link();
            let bound = match (link.body1(), link.body2()) {
                (Some(body1), Some(body2)) => items.contains(body1) && items.contains(body2),
                _ => false,
            };
            if !bound {
                return Err(SystemErrors::DanglingLink(link.name().to_string()).into());
            }
        }

        let mut offsets = Offsets::default();
        let mut advance = |item: &dyn PhysicsItem| {
            let current = offsets;
            offsets.x += item.n_coords_pos();
            offsets.v += item.n_coords_vel();
            offsets.l += item.n_constraints();
            current
        };
        for body in self.bodies.values_mut() {
            body.offsets = advance(&*body);
        }
        for shaft in self.shafts.values_mut() {
            shaft.offsets = advance(&*shaft);
        }
        for link in self.links.values_mut() {
            let o = advance(link.as_item());
            link.as_link_mut().base_mut().offsets = o;
        }
        self.n_coords_x = offsets.x;
        self.n_coords_v = offsets.v;
        self.n_constraints = offsets.l;

        let mut descriptor = take(&mut self.descriptor);
        descriptor.clear();
        self.for_each_item_mut(|item, _| item.inject_variables(&mut descriptor));
        let items = Items {
            system: self.id,
            gravity: self.gravity,
            bodies: &self.bodies,
            shafts: &self.shafts,
        };
        for link in self.links.values_mut() {
            link.as_item_mut().inject_constraints(&items, &mut descriptor);
        }
        self.descriptor = descriptor;
        self.needs_setup = false;

        debug!(
            n_coords_x = self.n_coords_x,
            n_coords_v = self.n_coords_v,
            n_constraints = self.n_constraints,
            "system setup"
        );
        Ok(())
    }

    /// Updates every link at the current time.
    pub fn update(&mut self, update_assets: bool) {
        let items = Items {
            system: self.id,
            gravity: self.gravity,
            bodies: &self.bodies,
            shafts: &self.shafts,
        };
        let t = self.time;
        for link in self.links.values_mut() {
            link.as_link_mut().update(&items, t, update_assets);
        }
    }

    /// Advances the system by one step of `options.dt`.
    pub fn do_step(&mut self, options: &StepOptions) -> Result<(), MultibodyErrors> {
        options.validate()?;
        if self.needs_setup {
            self.setup()?;
        }
        self.update(true);
        match options.timestepper {
            Timestepper::EulerImplicitLinearized => euler_implicit_linearized(
                self,
                options.dt,
                options.do_clamp,
                options.recovery_clamp,
            )?,
            Timestepper::DescriptorImpulse => self.descriptor_impulse_step(options)?,
        }
        trace!(t = self.time, "step done");
        Ok(())
    }

    /// Runs `n_steps` steps, stopping at the first error.
    pub fn run(&mut self, options: &StepOptions, n_steps: usize) -> Result<(), MultibodyErrors> {
        for _ in 0..n_steps {
            self.do_step(options)?;
        }
        Ok(())
    }

    /// The linearized implicit Euler step assembled item by item into the descriptor.
    fn descriptor_impulse_step(&mut self, options: &StepOptions) -> Result<(), SolverErrors> {
        let dt = options.dt;
        let mut descriptor = take(&mut self.descriptor);
        {
            let items = self.items();
            self.for_each_item(|item, _| {
                item.variables_fb_reset(&mut descriptor);
                item.variables_fb_load_forces(&items, &mut descriptor, dt);
                item.variables_qb_load_speed(&mut descriptor);
                item.variables_fb_increment_mq(&mut descriptor);
            });
            self.for_each_item(|item, _| {
                item.constraints_bi_reset(&mut descriptor);
                item.constraints_bi_load_c(
                    &mut descriptor,
                    1.0 / dt,
                    options.recovery_clamp,
                    options.do_clamp,
                );
                item.constraints_bi_load_ct(&mut descriptor, 1.0);
                item.constraints_load_jacobians(&mut descriptor);
            });
        }

        let result = descriptor.solve();
        if result.is_ok() {
            self.for_each_item_mut(|item, _| item.variables_qb_set_speed(&descriptor, dt));
            self.for_each_item_mut(|item, _| item.constraints_fetch_react(&descriptor, 1.0 / dt));
            self.for_each_item_mut(|item, _| item.variables_qb_increment_position(dt));
        }
        self.descriptor = descriptor;
        result?;

        self.time += dt;
        self.update(true);
        Ok(())
    }
}

impl Integrable for System {
    fn n_coords_x(&self) -> usize {
        self.n_coords_x
    }

    fn n_coords_v(&self) -> usize {
        self.n_coords_v
    }

    fn n_constraints(&self) -> usize {
        self.n_constraints
    }

    fn state_gather(&self, x: &mut State, v: &mut StateDelta, t: &mut f64) {
        self.for_each_item(|item, o| item.int_state_gather(o.x, x, o.v, v, t));
        *t = self.time;
    }

    fn state_scatter(&mut self, x: &State, v: &StateDelta, t: f64, full_update: bool) {
        self.for_each_item_mut(|item, o| item.int_state_scatter(o.x, x, o.v, v, t));
        self.time = t;
        self.update(full_update);
    }

    fn state_gather_acceleration(&self, a: &mut StateDelta) {
        self.for_each_item(|item, o| item.int_state_gather_acceleration(o.v, a));
    }

    fn state_gather_reactions(&self, l: &mut DVector<f64>) {
        self.for_each_item(|item, o| item.int_state_gather_reactions(o.l, l));
    }

    fn state_scatter_acceleration(&mut self, a: &StateDelta) {
        self.for_each_item_mut(|item, o| item.int_state_scatter_acceleration(o.v, a));
    }

    fn state_scatter_reactions(&mut self, l: &DVector<f64>) {
        self.for_each_item_mut(|item, o| item.int_state_scatter_reactions(o.l, l));
    }

    fn state_increment(&self, x_new: &mut State, x: &State, dv: &StateDelta) {
        self.for_each_item(|item, o| item.int_state_increment(o.x, x_new, x, o.v, dv));
    }

    fn load_residual_f(&self, r: &mut DVector<f64>, c: f64) {
        let items = self.items();
        self.for_each_item(|item, o| item.int_load_residual_f(&items, o.v, r, c));
    }

    fn load_residual_mv(&self, r: &mut DVector<f64>, w: &DVector<f64>, c: f64) {
        self.for_each_item(|item, o| item.int_load_residual_mv(o.v, r, w, c));
    }

    fn load_lumped_mass_md(&self, md: &mut DVector<f64>, err: &mut f64, c: f64) {
        self.for_each_item(|item, o| item.int_load_lumped_mass_md(o.v, md, err, c));
    }

    fn load_residual_cql(&self, r: &mut DVector<f64>, l: &DVector<f64>, c: f64) {
        let items = self.items();
        self.for_each_item(|item, o| item.int_load_residual_cql(&items, o.l, r, l, c));
    }

    fn load_constraint_c(
        &self,
        qc: &mut DVector<f64>,
        c: f64,
        do_clamp: bool,
        recovery_clamp: f64,
    ) {
        self.for_each_item(|item, o| {
            item.int_load_constraint_c(o.l, qc, c, do_clamp, recovery_clamp)
        });
    }

    fn load_constraint_ct(&self, qc: &mut DVector<f64>, c: f64) {
        self.for_each_item(|item, o| item.int_load_constraint_ct(o.l, qc, c));
    }

    fn solve_descriptor(
        &mut self,
        v: &mut StateDelta,
        l: &mut DVector<f64>,
        r: &DVector<f64>,
        qc: &DVector<f64>,
    ) -> Result<(), SolverErrors> {
        let mut descriptor = take(&mut self.descriptor);
        self.for_each_item(|item, o| {
            item.int_to_descriptor(&mut descriptor, o.v, v, r, o.l, l, qc)
        });
        let result = descriptor.solve();
        if result.is_ok() {
            self.for_each_item(|item, o| item.int_from_descriptor(&descriptor, o.v, v, o.l, l));
        }
        self.descriptor = descriptor;
        result
    }
}
