pub mod archive;
pub mod body;
pub mod link;
pub mod motor;
pub mod shaft;
pub mod solver;
pub mod system;

use archive::ArchiveErrors;
use body::BodyErrors;
use link::LinkErrors;
use shaft::ShaftErrors;
use solver::SolverErrors;
use system::{SystemErrors, options::StepOptionsErrors};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum MultibodyErrors {
    #[error("{0}")]
    Archive(#[from] ArchiveErrors),
    #[error("{0}")]
    Body(#[from] BodyErrors),
    #[error("{0}")]
    Link(#[from] LinkErrors),
    #[error("{0}")]
    Shaft(#[from] ShaftErrors),
    #[error("{0}")]
    Solver(#[from] SolverErrors),
    #[error("{0}")]
    StepOptions(#[from] StepOptionsErrors),
    #[error("{0}")]
    System(#[from] SystemErrors),
}
