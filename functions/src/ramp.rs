use crate::FunctionModel;
use serde::{Deserialize, Serialize};

/// `f(t) = y0 + slope * t`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ramp {
    pub y0: f64,
    pub slope: f64,
}

impl Ramp {
    pub fn new(y0: f64, slope: f64) -> Self {
        Self { y0, slope }
    }
}

impl FunctionModel for Ramp {
    fn value(&self, t: f64) -> f64 {
        self.y0 + self.slope * t
    }

    fn derivative(&self, _t: f64) -> f64 {
        self.slope
    }

    fn second_derivative(&self, _t: f64) -> f64 {
        0.0
    }
}
