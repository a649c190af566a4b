pub mod constraint;
pub mod descriptor;
pub mod timestepper;
pub mod variables;

use crate::system::Items;
use descriptor::SystemDescriptor;
use nalgebra::DVector;
use thiserror::Error;

#[derive(Debug, Clone, Copy, Error, PartialEq)]
pub enum SolverErrors {
    #[error("mass matrix of variable block {0} is not invertible")]
    SingularMass(usize),
    #[error("constraint system is singular (redundant or conflicting rows)")]
    Singular,
    #[error("jacobian of constraint row {0} does not match the size of its variable block")]
    DimensionMismatch(usize),
}

/// Position-level coordinates, one entry per position coordinate of every item.
pub type State = DVector<f64>;
/// Velocity-level coordinates (speeds, accelerations, increments).
pub type StateDelta = DVector<f64>;

/// Where an item's slices start in the system-wide state, speed and multiplier vectors.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Offsets {
    pub x: usize,
    pub v: usize,
    pub l: usize,
}

/// Clamps a scaled position violation to the recovery speed limit.
pub fn clamp_violation(value: f64, recovery_clamp: f64, do_clamp: bool) -> f64 {
    if do_clamp {
        value.clamp(-recovery_clamp, recovery_clamp)
    } else {
        value
    }
}

/// Contract between the system and anything owning state, variables or constraint rows.
///
/// Every method has a no-op default so each item only implements the hooks it uses.
/// Offsets are always the item's own offsets; offsets of other items are found through `Items`.
///
/// The `int_*` family works on flat system vectors and is used by the timesteppers.
/// The `variables_*` / `constraints_*` family works directly on the descriptor.
pub trait PhysicsItem {
    fn n_coords_pos(&self) -> usize {
        0
    }
    fn n_coords_vel(&self) -> usize {
        0
    }
    fn n_constraints(&self) -> usize {
        0
    }

    fn int_state_gather(
        &self,
        _off_x: usize,
        _x: &mut State,
        _off_v: usize,
        _v: &mut StateDelta,
        _t: &mut f64,
    ) {
    }

    /// Writes state back into the item. The system calls `update` once afterwards.
    fn int_state_scatter(
        &mut self,
        _off_x: usize,
        _x: &State,
        _off_v: usize,
        _v: &StateDelta,
        _t: f64,
    ) {
    }

    fn int_state_gather_acceleration(&self, _off_a: usize, _a: &mut StateDelta) {}

    fn int_state_scatter_acceleration(&mut self, _off_a: usize, _a: &StateDelta) {}

    fn int_state_gather_reactions(&self, _off_l: usize, _l: &mut DVector<f64>) {}

    fn int_state_scatter_reactions(&mut self, _off_l: usize, _l: &DVector<f64>) {}

    /// `x_new = x ⊕ dv`. Plain addition unless the item has a manifold coordinate.
    fn int_state_increment(
        &self,
        off_x: usize,
        x_new: &mut State,
        x: &State,
        off_v: usize,
        dv: &StateDelta,
    ) {
        for i in 0..self.n_coords_pos() {
            x_new[off_x + i] = x[off_x + i] + dv[off_v + i];
        }
    }

    /// `r += c * F`
    fn int_load_residual_f(&self, _items: &Items, _off_v: usize, _r: &mut DVector<f64>, _c: f64) {}

    /// `r += c * M * w`
    fn int_load_residual_mv(
        &self,
        _off_v: usize,
        _r: &mut DVector<f64>,
        _w: &DVector<f64>,
        _c: f64,
    ) {
    }

    /// `md += c * diag(M)`, `err` accumulates the off-diagonal mass that lumping drops.
    fn int_load_lumped_mass_md(
        &self,
        _off_v: usize,
        _md: &mut DVector<f64>,
        _err: &mut f64,
        _c: f64,
    ) {
    }

    /// `r += c * Cq^T * l`
    fn int_load_residual_cql(
        &self,
        _items: &Items,
        _off_l: usize,
        _r: &mut DVector<f64>,
        _l: &DVector<f64>,
        _c: f64,
    ) {
    }

    /// `qc += clamp(c * C)`
    fn int_load_constraint_c(
        &self,
        _off_l: usize,
        _qc: &mut DVector<f64>,
        _c: f64,
        _do_clamp: bool,
        _recovery_clamp: f64,
    ) {
    }

    /// `qc += c * dC/dt`
    fn int_load_constraint_ct(&self, _off_l: usize, _qc: &mut DVector<f64>, _c: f64) {}

    #[allow(clippy::too_many_arguments)]
    fn int_to_descriptor(
        &self,
        _descriptor: &mut SystemDescriptor,
        _off_v: usize,
        _v: &StateDelta,
        _r: &DVector<f64>,
        _off_l: usize,
        _l: &DVector<f64>,
        _qc: &DVector<f64>,
    ) {
    }

    fn int_from_descriptor(
        &self,
        _descriptor: &SystemDescriptor,
        _off_v: usize,
        _v: &mut StateDelta,
        _off_l: usize,
        _l: &mut DVector<f64>,
    ) {
    }

    fn inject_variables(&mut self, _descriptor: &mut SystemDescriptor) {}

    fn inject_constraints(&mut self, _items: &Items, _descriptor: &mut SystemDescriptor) {}

    fn constraints_bi_reset(&self, _descriptor: &mut SystemDescriptor) {}

    /// `b_i += clamp(factor * C)`
    fn constraints_bi_load_c(
        &self,
        _descriptor: &mut SystemDescriptor,
        _factor: f64,
        _recovery_clamp: f64,
        _do_clamp: bool,
    ) {
    }

    /// `b_i += factor * dC/dt`
    fn constraints_bi_load_ct(&self, _descriptor: &mut SystemDescriptor, _factor: f64) {}

    fn constraints_load_jacobians(&self, _descriptor: &mut SystemDescriptor) {}

    /// Reads `l_i * factor` back as the item's reaction.
    fn constraints_fetch_react(&mut self, _descriptor: &SystemDescriptor, _factor: f64) {}

    fn variables_fb_reset(&self, _descriptor: &mut SystemDescriptor) {}

    /// `fb += factor * F`
    fn variables_fb_load_forces(
        &self,
        _items: &Items,
        _descriptor: &mut SystemDescriptor,
        _factor: f64,
    ) {
    }

    /// `qb = v`
    fn variables_qb_load_speed(&self, _descriptor: &mut SystemDescriptor) {}

    /// `fb += M * qb`
    fn variables_fb_increment_mq(&self, _descriptor: &mut SystemDescriptor) {}

    /// `v = qb`, with the acceleration estimated over `step`.
    fn variables_qb_set_speed(&mut self, _descriptor: &SystemDescriptor, _step: f64) {}

    fn variables_qb_increment_position(&mut self, _step: f64) {}
}
