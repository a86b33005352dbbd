//! Integration test crate for the FDO protocol engine.
//!
//! This crate has no library code — it only contains integration tests
//! that drive complete protocol runs (DI, TO0, TO1, TO2) through the
//! dispatcher with an in-test device harness.
//!
//! Run all integration tests:
//! ```sh
//! cargo test -p fdo-integration-tests
//! ```
