use crate::FunctionModel;
use serde::{Deserialize, Serialize};

/// `f(t) = value`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constant {
    pub value: f64,
}

impl Default for Constant {
    fn default() -> Self {
        Self { value: 1.0 }
    }
}

impl Constant {
    pub fn new(value: f64) -> Self {
        Self { value }
    }
}

impl FunctionModel for Constant {
    fn value(&self, _t: f64) -> f64 {
        self.value
    }

    fn derivative(&self, _t: f64) -> f64 {
        0.0
    }

    fn second_derivative(&self, _t: f64) -> f64 {
        0.0
    }
}
