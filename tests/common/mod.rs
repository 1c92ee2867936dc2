//! Shared test utilities for the integration suites.
//!
//! This module provides:
//! - In-process clusters of shelter nodes over a [`MeshHub`]
//! - Form fixtures for pets and applications
//! - A polling `eventually` helper for convergence assertions

#![allow(dead_code)]

pub mod cluster;
pub mod fixtures;

pub use cluster::*;
pub use fixtures::*;
