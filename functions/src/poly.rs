use crate::FunctionModel;
use serde::{Deserialize, Serialize};

/// `f(t) = c0 + c1 t + c2 t^2 + ...`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Poly {
    coefficients: Vec<f64>,
}

impl Poly {
    pub fn new(coefficients: Vec<f64>) -> Self {
        Self { coefficients }
    }

    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }

    // Horner evaluation of the `order`-th derivative
    fn eval(&self, t: f64, order: usize) -> f64 {
        let mut result = 0.0;
        for (i, c) in self.coefficients.iter().enumerate().skip(order).rev() {
            let factor: f64 = ((i - order + 1)..=i).map(|k| k as f64).product();
            result = result * t + c * factor;
        }
        result
    }
}

impl FunctionModel for Poly {
    fn value(&self, t: f64) -> f64 {
        self.eval(t, 0)
    }

    fn derivative(&self, t: f64) -> f64 {
        self.eval(t, 1)
    }

    fn second_derivative(&self, t: f64) -> f64 {
        self.eval(t, 2)
    }
}
