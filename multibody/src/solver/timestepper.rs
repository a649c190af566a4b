use super::{SolverErrors, State, StateDelta};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use tracing::trace;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Timestepper {
    /// Linearized implicit Euler on flat state vectors.
    #[default]
    EulerImplicitLinearized,
    /// The same scheme assembled directly into the descriptor, item by item.
    DescriptorImpulse,
}

/// A system that can be advanced by a timestepper working on flat vectors.
pub trait Integrable {
    fn n_coords_x(&self) -> usize;
    fn n_coords_v(&self) -> usize;
    fn n_constraints(&self) -> usize;

    fn state_gather(&self, x: &mut State, v: &mut StateDelta, t: &mut f64);
    fn state_gather_acceleration(&self, a: &mut StateDelta);
    /// Force-level multipliers of the last step.
    fn state_gather_reactions(&self, l: &mut DVector<f64>);
    /// Writes the state back and updates every item at time `t`.
    fn state_scatter(&mut self, x: &State, v: &StateDelta, t: f64, full_update: bool);
    fn state_scatter_acceleration(&mut self, a: &StateDelta);
    fn state_scatter_reactions(&mut self, l: &DVector<f64>);
    fn state_increment(&self, x_new: &mut State, x: &State, dv: &StateDelta);

    fn load_residual_f(&self, r: &mut DVector<f64>, c: f64);
    fn load_residual_mv(&self, r: &mut DVector<f64>, w: &DVector<f64>, c: f64);
    /// `md += c * diag(M)`, `err` accumulates the off-diagonal mass left out.
    fn load_lumped_mass_md(&self, md: &mut DVector<f64>, err: &mut f64, c: f64);
    fn load_residual_cql(&self, r: &mut DVector<f64>, l: &DVector<f64>, c: f64);
    fn load_constraint_c(&self, qc: &mut DVector<f64>, c: f64, do_clamp: bool, recovery_clamp: f64);
    fn load_constraint_ct(&self, qc: &mut DVector<f64>, c: f64);

    /// Solves `M v = r + Cq^T l`, `Cq v + qc = 0` for `v` and `l`.
    fn solve_descriptor(
        &mut self,
        v: &mut StateDelta,
        l: &mut DVector<f64>,
        r: &DVector<f64>,
        qc: &DVector<f64>,
    ) -> Result<(), SolverErrors>;
}

/// One step of linearized implicit Euler:
///
/// ```text
/// M v_new = M v + h F + Cq^T (h L)
/// Cq v_new + clamp(C / h) + Ct = 0
/// x_new = x ⊕ h v_new
/// ```
///
/// Multipliers are returned to the items as force-level reactions `L`.
pub fn euler_implicit_linearized<I: Integrable>(
    integrable: &mut I,
    dt: f64,
    do_clamp: bool,
    recovery_clamp: f64,
) -> Result<(), SolverErrors> {
    let nx = integrable.n_coords_x();
    let nv = integrable.n_coords_v();
    let nc = integrable.n_constraints();

    let mut x = State::zeros(nx);
    let mut v = StateDelta::zeros(nv);
    let mut t = 0.0;
    integrable.state_gather(&mut x, &mut v, &mut t);

    let mut r = DVector::zeros(nv);
    let mut qc = DVector::zeros(nc);
    // last step's reactions, as impulses, seed the multipliers
    let mut l = DVector::zeros(nc);
    integrable.state_gather_reactions(&mut l);
    l *= dt;
    integrable.load_residual_f(&mut r, dt);
    integrable.load_residual_mv(&mut r, &v, 1.0);
    integrable.load_constraint_c(&mut qc, 1.0 / dt, do_clamp, recovery_clamp);
    integrable.load_constraint_ct(&mut qc, 1.0);

    let mut v_new = v.clone();
    integrable.solve_descriptor(&mut v_new, &mut l, &r, &qc)?;
    // impulses to forces
    l /= dt;

    let mut x_new = x.clone();
    integrable.state_increment(&mut x_new, &x, &(&v_new * dt));
    integrable.state_scatter_acceleration(&((&v_new - &v) / dt));
    integrable.state_scatter(&x_new, &v_new, t + dt, true);
    integrable.state_scatter_reactions(&l);

    trace!(t = t + dt, nx, nv, nc, "euler implicit linearized step");
    Ok(())
}
