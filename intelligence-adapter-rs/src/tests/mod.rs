//! Tests that exercise several adapter modules together
//!
//! Scenario tests driving the whole runtime over the in-memory bus live in
//! the crate's `tests/` directory.

mod gateway_tests;
