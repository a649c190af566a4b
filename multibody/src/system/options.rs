use crate::solver::timestepper::Timestepper;
use ron::ser::{PrettyConfig, to_string_pretty};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StepOptionsErrors {
    #[error("step size must be finite and greater than 0.0, got {0}")]
    DtMustBePositive(f64),
    #[error("recovery clamp must be finite and non-negative, got {0}")]
    InvalidRecoveryClamp(f64),
    #[error("could not parse step options: {0}")]
    Ron(String),
}

/// Settings for `System::do_step`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepOptions {
    pub dt: f64,
    pub timestepper: Timestepper,
    /// largest speed used to pull a drifted constraint back, when clamping is on
    pub recovery_clamp: f64,
    pub do_clamp: bool,
}

impl Default for StepOptions {
    fn default() -> Self {
        Self {
            dt: 0.01,
            timestepper: Timestepper::default(),
            recovery_clamp: 0.1,
            do_clamp: false,
        }
    }
}

impl StepOptions {
    pub fn new(dt: f64) -> Result<Self, StepOptionsErrors> {
        let options = Self {
            dt,
            ..Default::default()
        };
        options.validate()?;
        Ok(options)
    }

    pub fn with_timestepper(mut self, timestepper: Timestepper) -> Self {
        self.timestepper = timestepper;
        self
    }

    pub fn with_recovery_clamp(mut self, recovery_clamp: f64) -> Result<Self, StepOptionsErrors> {
        self.recovery_clamp = recovery_clamp;
        self.validate()?;
        Ok(self)
    }

    pub fn with_clamping(mut self, do_clamp: bool) -> Self {
        self.do_clamp = do_clamp;
        self
    }

    pub fn validate(&self) -> Result<(), StepOptionsErrors> {
        if !(self.dt.is_finite() && self.dt > 0.0) {
            return Err(StepOptionsErrors::DtMustBePositive(self.dt));
        }
        if !(self.recovery_clamp.is_finite() && self.recovery_clamp >= 0.0) {
            return Err(StepOptionsErrors::InvalidRecoveryClamp(self.recovery_clamp));
        }
        Ok(())
    }

    pub fn to_ron(&self) -> Result<String, StepOptionsErrors> {
        to_string_pretty(self, PrettyConfig::new())
            .map_err(|e| StepOptionsErrors::Ron(e.to_string()))
    }

    pub fn from_ron(s: &str) -> Result<Self, StepOptionsErrors> {
        let options: Self = ron::from_str(s).map_err(|e| StepOptionsErrors::Ron(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }
}
