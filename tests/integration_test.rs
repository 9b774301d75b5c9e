// tests/integration_test.rs

//! Integration tests driving real nodes over loopback TCP. Everything here
//! works without the media tool installed; media failures are part of the
//! scenarios.

mod integration {
    pub mod cluster_test;
    pub mod pipeline_test;
    pub mod test_helpers;
}
