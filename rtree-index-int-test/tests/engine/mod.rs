//! Tree engine integration tests.
//!
//! These tests drive the engine through the registry and check the
//! structural guarantees of the tree after realistic workloads.

mod engine_properties_test;
mod engine_scenario_test;
