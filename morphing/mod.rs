pub mod basis;
pub mod components;
pub mod weights;

pub use basis::{BasisOptions, BasisSolution, ErrorFunctional, optimize_basis};
pub use components::{evaluate_components, find_components, monomial_matrix};
pub use weights::Morpher;
