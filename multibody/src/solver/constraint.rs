use super::variables::VariablesKey;
use nalgebra::DVector;

/// Key of a constraint row registered in a `SystemDescriptor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConstraintKey(pub(crate) usize);

/// A scalar bilateral constraint row coupling two variable blocks.
///
/// The row reads `cq_a * q_a + cq_b * q_b + b_i = 0` and its multiplier `l_i`
/// enters the dynamics of each block as `cq^T * l_i`.
#[derive(Debug, Clone)]
pub struct ConstraintTwoGeneric {
    pub variables_a: Option<VariablesKey>,
    pub variables_b: Option<VariablesKey>,
    pub cq_a: DVector<f64>,
    pub cq_b: DVector<f64>,
    pub b_i: f64,
    pub l_i: f64,
    /// constraint force mixing, added to the diagonal of the Schur complement
    pub cfm_i: f64,
    pub active: bool,
}

impl ConstraintTwoGeneric {
    pub fn new(ndof_a: usize, ndof_b: usize) -> Self {
        Self {
            variables_a: None,
            variables_b: None,
            cq_a: DVector::zeros(ndof_a),
            cq_b: DVector::zeros(ndof_b),
            b_i: 0.0,
            l_i: 0.0,
            cfm_i: 0.0,
            active: true,
        }
    }

    pub fn set_variables(&mut self, a: VariablesKey, b: VariablesKey) {
        self.variables_a = Some(a);
        self.variables_b = Some(b);
    }

    /// `r += cq^T * s`, with the two blocks located at `off_a` and `off_b` of `r`.
    pub fn add_jacobian_transposed_times_scalar_into(
        &self,
        r: &mut DVector<f64>,
        off_a: usize,
        off_b: usize,
        s: f64,
    ) {
        let na = self.cq_a.len();
        let nb = self.cq_b.len();
        r.rows_mut(off_a, na).axpy(s, &self.cq_a, 1.0);
        r.rows_mut(off_b, nb).axpy(s, &self.cq_b, 1.0);
    }

    /// `cq * v`, with the two blocks located at `off_a` and `off_b` of `v`.
    pub fn compute_jacobian_times_state(
        &self,
        v: &DVector<f64>,
        off_a: usize,
        off_b: usize,
    ) -> f64 {
        let na = self.cq_a.len();
        let nb = self.cq_b.len();
        self.cq_a.dot(&v.rows(off_a, na)) + self.cq_b.dot(&v.rows(off_b, nb))
    }
}
