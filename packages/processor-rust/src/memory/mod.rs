//! In-process collaborators: an ownership store and an event stream.
//!
//! Used by the test suites and the `simulate` binary; also a reference for
//! what a durable backend has to provide.

mod store;
mod stream;

pub use store::InMemoryOwnershipStore;
pub use stream::{InMemoryConnector, InMemoryEventStream, ReceiveFault};
