//! Primitives shared by the deferral crates: logging, header keys and the
//! transaction mode an endpoint runs under.

pub mod headers;
pub mod logging;
pub mod transaction;

pub use headers::Headers;
pub use tracing;
pub use transaction::TransactionMode;
