//! Conformer generation for molecular graphs by Distance Geometry
//!
//! From a molecular graph with stereocenter assignment state, permissible
//! interatomic distance ranges are modeled, a concrete distance matrix is
//! sampled, embedded into four dimensions by eigendecomposition of its Gram
//! matrix, and refined against distance, chirality and dihedral constraints
//! by staged quasi-Newton minimization.

#[macro_use]
extern crate lazy_static;

pub mod elements;
pub mod geometry;
pub mod shapes;
pub mod molecule;
pub mod dg;
