// Trading decisions: crossover signal machine, advisor veto, exit overlay

pub mod advisor;
pub mod crossover;
pub mod quartermaster;

pub use advisor::{advisor_allows, AdvisorInputs};
pub use crossover::{band_position, BandPosition, CrossoverMachine};
pub use quartermaster::{evaluate_exit, ExitInputs, Quartermaster};
