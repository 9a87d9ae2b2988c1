//! opwire - Schema-validated request dispatch over a generated REST client
//!
//! This library sits in front of a machine-generated REST operation set:
//! callers name a remote operation by a stable logical name (or alias)
//! plus loosely-typed parameters, and opwire turns that into a
//! schema-validated, correctly-shaped call, returning a uniformly
//! wrapped response. It also owns the session/token lifecycle and a
//! resumable chunked-upload protocol for large file transfer.

pub mod alias;
pub mod client;
pub mod operation;
pub mod ops;
pub mod params;
pub mod registry;
pub mod response;
pub mod session;
pub mod transport;
pub mod upload;
pub mod validation;

#[cfg(test)]
mod test_support;

pub use alias::*;
pub use client::*;
pub use operation::*;
pub use params::*;
pub use registry::*;
pub use response::*;
pub use session::*;
pub use transport::*;
pub use upload::*;
pub use validation::*;
