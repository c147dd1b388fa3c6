//! Integration harness: scenario tests against the scriptable mock
//! driver.

mod discovery_tests;
mod endpoint_tests;
mod messaging_tests;
mod mock_driver;
