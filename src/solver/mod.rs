//! Accelerated SMO solver
//!
//! The solver follows the working-set selection of Fan, Chen and Lin
//! ("Working Set Selection Using Second Order Information for Training
//! SVM", JMLR 2005): the first index maximises the KKT violation, the
//! second minimises the second-order objective change. Per-element work runs
//! as device passes, reductions pick the winners, and kernel columns are
//! served from an LRU cache on the device.

pub mod controller;
pub mod objective;
pub mod problem;

pub use self::controller::{DeviceSolver, Selection, SolverInit};
pub use self::objective::{calculate_rho, objective_value};
pub use self::problem::{load_problem_parameters, DeviceProblem};
