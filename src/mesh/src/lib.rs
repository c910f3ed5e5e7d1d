//! Quadric error metric mesh simplification.
//!
//! Hoppe-style edge collapse with per-vertex appearance attributes and an
//! optional volume constraint; see [Hoppe 1999, "New Quadric Metric for
//! Simplifying Meshes with Appearance Attributes"] and [Hoppe 2000,
//! "Efficient minimization of new quadric metric"].
//!
//! The simplifier owns dense vertex/triangle/edge tables; all
//! cross-references are indices. Vertices coincident in space are grouped
//! into sibling rings so attribute seams collapse coherently.

#[macro_use]
extern crate log;

pub mod elements;
pub mod list;
pub mod quadric;
pub mod simplifier;

pub use self::elements::{flags, MeshVert, SimpFlags};
pub use self::quadric::{Quadric, QuadricAttr, QuadricAttrOptimizer};
pub use self::simplifier::MeshSimplifier;
