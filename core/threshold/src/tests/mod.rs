//! In-process test harness, shared by the unit tests, the integration tests and `mhe-demo`.
