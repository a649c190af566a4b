//! Scalar functions of time used to prescribe motion laws (speed and angle profiles).
//!
//! Every function provides its value and its first and second time derivatives,
//! since rheonomic constraints need the derivative for their `Ct` term.

pub mod constant;
pub mod poly;
pub mod ramp;
pub mod sine;
pub mod table;

use constant::Constant;
use poly::Poly;
use ramp::Ramp;
use serde::{Deserialize, Serialize};
use sine::Sine;
use table::{Table, TableErrors};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum FunctionErrors {
    #[error("frequency must be greater than or equal to 0")]
    NegativeFrequency,
    #[error("{0}")]
    Table(#[from] TableErrors),
}

pub trait FunctionModel {
    /// Value of the function at time `t`
    fn value(&self, t: f64) -> f64;
    /// First derivative with respect to time
    fn derivative(&self, t: f64) -> f64;
    /// Second derivative with respect to time
    fn second_derivative(&self, t: f64) -> f64;
    /// Called once per owner update with the current time.
    /// Stateless functions ignore it.
    fn update(&mut self, _t: f64) {}
}

/// The closed set of motion laws.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MotionFunction {
    Constant(Constant),
    Poly(Poly),
    Ramp(Ramp),
    Sine(Sine),
    Table(Table),
}

impl Default for MotionFunction {
    fn default() -> Self {
        MotionFunction::Constant(Constant::default())
    }
}

impl MotionFunction {
    pub fn constant(value: f64) -> Self {
        MotionFunction::Constant(Constant::new(value))
    }

    pub fn ramp(y0: f64, slope: f64) -> Self {
        MotionFunction::Ramp(Ramp::new(y0, slope))
    }

    pub fn sine(amplitude: f64, frequency: f64, phase: f64) -> Result<Self, FunctionErrors> {
        Ok(MotionFunction::Sine(Sine::new(amplitude, frequency, phase)?))
    }

    pub fn poly(coefficients: Vec<f64>) -> Self {
        MotionFunction::Poly(Poly::new(coefficients))
    }

    pub fn table(times: Vec<f64>, values: Vec<f64>) -> Result<Self, FunctionErrors> {
        Ok(MotionFunction::Table(Table::new(times, values)?))
    }
}

impl FunctionModel for MotionFunction {
    fn value(&self, t: f64) -> f64 {
        match self {
            MotionFunction::Constant(f) => f.value(t),
            MotionFunction::Poly(f) => f.value(t),
            MotionFunction::Ramp(f) => f.value(t),
            MotionFunction::Sine(f) => f.value(t),
            MotionFunction::Table(f) => f.value(t),
        }
    }

    fn derivative(&self, t: f64) -> f64 {
        match self {
            MotionFunction::Constant(f) => f.derivative(t),
            MotionFunction::Poly(f) => f.derivative(t),
            MotionFunction::Ramp(f) => f.derivative(t),
            MotionFunction::Sine(f) => f.derivative(t),
            MotionFunction::Table(f) => f.derivative(t),
        }
    }

    fn second_derivative(&self, t: f64) -> f64 {
        match self {
            MotionFunction::Constant(f) => f.second_derivative(t),
            MotionFunction::Poly(f) => f.second_derivative(t),
            MotionFunction::Ramp(f) => f.second_derivative(t),
            MotionFunction::Sine(f) => f.second_derivative(t),
            MotionFunction::Table(f) => f.second_derivative(t),
        }
    }

    fn update(&mut self, t: f64) {
        match self {
            MotionFunction::Constant(f) => f.update(t),
            MotionFunction::Poly(f) => f.update(t),
            MotionFunction::Ramp(f) => f.update(t),
            MotionFunction::Sine(f) => f.update(t),
            MotionFunction::Table(f) => f.update(t),
        }
    }
}

impl From<Constant> for MotionFunction {
    fn from(value: Constant) -> Self {
        MotionFunction::Constant(value)
    }
}
impl From<Poly> for MotionFunction {
    fn from(value: Poly) -> Self {
        MotionFunction::Poly(value)
    }
}
impl From<Ramp> for MotionFunction {
    fn from(value: Ramp) -> Self {
        MotionFunction::Ramp(value)
    }
}
impl From<Sine> for MotionFunction {
    fn from(value: Sine) -> Self {
        MotionFunction::Sine(value)
    }
}
impl From<Table> for MotionFunction {
    fn from(value: Table) -> Self {
        MotionFunction::Table(value)
    }
}
