use nalgebra::{DMatrix, DVector};

/// Key of a variable block registered in a `SystemDescriptor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VariablesKey(pub(crate) usize);

/// A block of velocity-level unknowns with its mass matrix.
///
/// `qb` holds speeds (or speed increments) and `fb` the known right hand side,
/// so that an unconstrained block satisfies `mass * qb = fb`.
#[derive(Debug, Clone)]
pub struct Variables {
    pub mass: DMatrix<f64>,
    pub fb: DVector<f64>,
    pub qb: DVector<f64>,
    /// inactive blocks are held at zero speed and eliminated from the solve
    pub active: bool,
}

impl Variables {
    pub fn new(mass: DMatrix<f64>) -> Self {
        let ndof = mass.nrows();
        Self {
            mass,
            fb: DVector::zeros(ndof),
            qb: DVector::zeros(ndof),
            active: true,
        }
    }

    /// Block with `ndof` unknowns and mass `m` on the diagonal.
    pub fn with_diagonal_mass(ndof: usize, m: f64) -> Self {
        Self::new(DMatrix::from_diagonal_element(ndof, ndof, m))
    }

    pub fn ndof(&self) -> usize {
        self.qb.len()
    }

    /// `fb += mass * qb`
    pub fn compute_mass_times_qb_into_fb(&mut self) {
        self.fb += &self.mass * &self.qb;
    }
}
