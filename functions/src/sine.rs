use crate::{FunctionErrors, FunctionModel};
use serde::{Deserialize, Serialize};
use std::f64::consts::TAU;

/// `f(t) = amplitude * sin(2 pi frequency t + phase)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "SineData")]
pub struct Sine {
    amplitude: f64,
    frequency: f64, // Hz
    phase: f64,     // rad
}

#[derive(Deserialize)]
struct SineData {
    amplitude: f64,
    frequency: f64,
    phase: f64,
}

impl TryFrom<SineData> for Sine {
    type Error = FunctionErrors;

    fn try_from(data: SineData) -> Result<Self, Self::Error> {
        Sine::new(data.amplitude, data.frequency, data.phase)
    }
}

impl Sine {
    pub fn new(amplitude: f64, frequency: f64, phase: f64) -> Result<Self, FunctionErrors> {
        if frequency < 0.0 {
            return Err(FunctionErrors::NegativeFrequency);
        }
        Ok(Self {
            amplitude,
            frequency,
            phase,
        })
    }

    pub fn amplitude(&self) -> f64 {
        self.amplitude
    }

    pub fn frequency(&self) -> f64 {
        self.frequency
    }

    pub fn phase(&self) -> f64 {
        self.phase
    }

    fn omega(&self) -> f64 {
        TAU * self.frequency
    }
}

impl FunctionModel for Sine {
    fn value(&self, t: f64) -> f64 {
        self.amplitude * (self.omega() * t + self.phase).sin()
    }

    fn derivative(&self, t: f64) -> f64 {
        let w = self.omega();
        self.amplitude * w * (w * t + self.phase).cos()
    }

    fn second_derivative(&self, t: f64) -> f64 {
        let w = self.omega();
        -self.amplitude * w * w * (w * t + self.phase).sin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    const TOL: f64 = 1e-12;

    #[test]
    fn test_sine_quarter_period() {
        let f = Sine::new(2.0, 0.5, 0.0).unwrap();
        // quarter period at t = 0.5 s
        assert_abs_diff_eq!(f.value(0.5), 2.0, epsilon = TOL);
        assert_abs_diff_eq!(f.derivative(0.5), 0.0, epsilon = TOL);
        assert_abs_diff_eq!(
            f.second_derivative(0.5),
            -2.0 * std::f64::consts::PI.powi(2),
            epsilon = TOL
        );
    }

    #[test]
    fn test_sine_derivative_matches_finite_difference() {
        let f = Sine::new(1.5, 2.0, 0.3).unwrap();
        let h = 1e-6;
        let t = 0.37;
        let fd = (f.value(t + h) - f.value(t - h)) / (2.0 * h);
        assert_abs_diff_eq!(f.derivative(t), fd, epsilon = 1e-6);
    }

    #[test]
    fn test_deserialize_rejects_negative_frequency() {
        let back: Sine = ron::from_str("(amplitude: 1.0, frequency: 0.5, phase: 0.0)").unwrap();
        assert_eq!(back, Sine::new(1.0, 0.5, 0.0).unwrap());
        let err =
            ron::from_str::<Sine>("(amplitude: 1.0, frequency: -0.5, phase: 0.0)").unwrap_err();
        assert!(err.to_string().contains("frequency must be greater"));
    }
}
