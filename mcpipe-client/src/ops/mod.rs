//! Concrete operations.
//!
//! Every keyed operation except touch has a quiet form, enabled with
//! `.quiet()`. Quiet operations are completed by the next unrelated frame, so
//! a batch of them must end with a non-quiet operation (usually a no-op).

mod admin;
mod concat;
mod delete;
mod get;
mod mutate;
mod store;
mod touch;

pub use admin::{FlushOperation, NoOpOperation, StatsOperation};
pub use concat::{ConcatMode, ConcatOperation};
pub use delete::DeleteOperation;
pub use get::GetOperation;
pub use mutate::{MutateMode, MutateOperation};
pub use store::{StoreMode, StoreOperation};
pub use touch::TouchOperation;

use mcpipe_common::OpCode;

use crate::operation::RequestTag;
use crate::response::BinaryResponse;

fn select_opcode(opcode: OpCode, quiet: bool) -> OpCode {
    if quiet {
        opcode.quiet().unwrap_or(opcode)
    } else {
        opcode
    }
}

/// Quiet operations only claim their own frame; others take the next one.
///
/// Matching stays positional. The opaque only tells a quiet op's own error
/// frame apart from the answer of whatever follows it in the pipeline; without
/// it a quiet op at the head would swallow its successor's response.
fn quiet_handles(quiet: bool, tag: Option<RequestTag>, response: &BinaryResponse) -> bool {
    if !quiet {
        return true;
    }
    tag.is_some_and(|tag| tag.matches(response))
}
