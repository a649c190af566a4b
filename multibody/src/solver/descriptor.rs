use super::{
    SolverErrors,
    constraint::{ConstraintKey, ConstraintTwoGeneric},
    variables::{Variables, VariablesKey},
};
use nalgebra::{DMatrix, DVector};
use tracing::{trace, warn};

/// The assembled linear problem of one step.
///
/// Items register variable blocks and constraint rows, fill `fb`, `b_i` and the
/// jacobians, then `solve` finds speeds `q` and multipliers `l` such that
///
/// ```text
/// M q = fb + Cq^T l
/// Cq q + b = 0
/// ```
#[derive(Debug, Clone, Default)]
pub struct SystemDescriptor {
    variables: Vec<Variables>,
    constraints: Vec<ConstraintTwoGeneric>,
}

impl SystemDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.variables.clear();
        self.constraints.clear();
    }

    pub fn insert_variables(&mut self, variables: Variables) -> VariablesKey {
        self.variables.push(variables);
        VariablesKey(self.variables.len() - 1)
    }

    pub fn insert_constraint(&mut self, constraint: ConstraintTwoGeneric) -> ConstraintKey {
        self.constraints.push(constraint);
        ConstraintKey(self.constraints.len() - 1)
    }

    pub fn variables(&self, key: VariablesKey) -> Option<&Variables> {
        self.variables.get(key.0)
    }

    pub fn variables_mut(&mut self, key: VariablesKey) -> Option<&mut Variables> {
        self.variables.get_mut(key.0)
    }

    pub fn constraint(&self, key: ConstraintKey) -> Option<&ConstraintTwoGeneric> {
        self.constraints.get(key.0)
    }

    pub fn constraint_mut(&mut self, key: ConstraintKey) -> Option<&mut ConstraintTwoGeneric> {
        self.constraints.get_mut(key.0)
    }

    pub fn n_variables(&self) -> usize {
        self.variables.len()
    }

    pub fn n_constraints(&self) -> usize {
        self.constraints.len()
    }

    /// Offsets of every active block in the reduced unknown vector, and its size.
    fn active_offsets(&self) -> (Vec<Option<usize>>, usize) {
        let mut n = 0;
        let offsets = self
            .variables
            .iter()
            .map(|v| {
                if v.active {
                    let off = n;
                    n += v.ndof();
                    Some(off)
                } else {
                    None
                }
            })
            .collect();
        (offsets, n)
    }

    /// Solves the saddle point problem by the Schur complement
    /// `(Cq M^-1 Cq^T + cfm) l = -b - Cq M^-1 fb`, then `q = M^-1 (fb + Cq^T l)`.
    ///
    /// Inactive variable blocks get `qb = 0` and drop out of every row.
    /// Inactive rows get `l_i = 0`.
    pub fn solve(&mut self) -> Result<(), SolverErrors> {
        let (offsets, n) = self.active_offsets();

        let mut minv = DMatrix::<f64>::zeros(n, n);
        let mut fb = DVector::<f64>::zeros(n);
        for (i, (variables, off)) in self.variables.iter().zip(&offsets).enumerate() {
            let Some(off) = *off else { continue };
            let ndof = variables.ndof();
            let inv = variables
                .mass
                .clone()
                .try_inverse()
                .ok_or(SolverErrors::SingularMass(i))?;
            minv.view_mut((off, off), (ndof, ndof)).copy_from(&inv);
            fb.rows_mut(off, ndof).copy_from(&variables.fb);
        }

        let rows: Vec<usize> = self
            .constraints
            .iter()
            .enumerate()
            .filter(|(_, c)| c.active)
            .map(|(i, _)| i)
            .collect();
        let m = rows.len();

        let mut cq = DMatrix::<f64>::zeros(m, n);
        let mut b = DVector::<f64>::zeros(m);
        let mut cfm = DVector::<f64>::zeros(m);
        for (row, &i) in rows.iter().enumerate() {
            let c = &self.constraints[i];
            for (key, jac) in [(c.variables_a, &c.cq_a), (c.variables_b, &c.cq_b)] {
                let Some(key) = key else { continue };
                if self.variables.get(key.0).is_some_and(|v| v.ndof() != jac.len()) {
                    return Err(SolverErrors::DimensionMismatch(i));
                }
                let Some(Some(off)) = offsets.get(key.0) else {
                    continue;
                };
                let mut block = cq.view_mut((row, *off), (1, jac.len()));
                block += jac.transpose();
            }
            b[row] = c.b_i;
            cfm[row] = c.cfm_i;
        }

        let minv_fb = &minv * &fb;
        let mut l = DVector::<f64>::zeros(m);
        if m > 0 {
            let mut schur = &cq * &minv * cq.transpose();
            for row in 0..m {
                schur[(row, row)] += cfm[row];
            }
            let rhs = -&b - &cq * &minv_fb;
            l = match schur.lu().solve(&rhs) {
                Some(l) => l,
                None => {
                    warn!(n_constraints = m, "constraint rows are linearly dependent");
                    return Err(SolverErrors::Singular);
                }
            };
        }
        let q = &minv * (&fb + cq.transpose() * &l);
        trace!(n_unknowns = n, n_constraints = m, "descriptor solved");

        for (variables, off) in self.variables.iter_mut().zip(&offsets) {
            match off {
                Some(off) => {
                    let ndof = variables.ndof();
                    variables.qb.copy_from(&q.rows(*off, ndof));
                }
                None => variables.qb.fill(0.0),
            }
        }
        for c in self.constraints.iter_mut() {
            c.l_i = 0.0;
        }
        for (row, &i) in rows.iter().enumerate() {
            self.constraints[i].l_i = l[row];
        }
        Ok(())
    }
}
