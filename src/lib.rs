//! Mantle: a manifest compiler.
//!
//! Reads a declarative configuration language (classes, defines, nodes,
//! resources, collections, relationships) and compiles it into a per-node
//! catalog: a graph of resources with containment and ordering edges.

pub mod cli;
pub mod core;
pub mod loader;
pub mod store;
pub mod tripwire;
