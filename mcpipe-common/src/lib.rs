// mcpipe-common - Shared types and protocol definitions for mcpipe
//
// This crate defines the memcached binary protocol layout, bounded key and
// expiration types, and the error taxonomy shared by the client engine.

pub mod error;
pub mod protocol;
pub mod types;

// Re-export for convenience
pub use error::*;
pub use protocol::*;
pub use types::*;
