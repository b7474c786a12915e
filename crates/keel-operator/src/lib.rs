//! Keel operator: runs the Source controllers against a cluster

#![deny(missing_docs)]

/// Command-line and environment configuration
pub mod config;
/// Controller futures for each Source kind
pub mod controller_runner;
/// CRD generation and installation
pub mod crds;
