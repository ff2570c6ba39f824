//! sielink-test-harness: Mock transports for testing sielink protocol
//! engines without hardware.
//!
//! Two test doubles cover the two interaction shapes in the workspace:
//!
//! - [`MockTransport`] -- an ordered expectation queue for strict
//!   command/response exchanges.
//! - [`ScriptedTransport`] -- a free-running byte stream driven through a
//!   [`ScriptHandle`], for engines that read continuously or out of step
//!   with their writes.

pub mod mock_transport;
pub mod scripted;

pub use mock_transport::MockTransport;
pub use scripted::{scripted_transport, ScriptHandle, ScriptedTransport};
