//! Client protocol: envelopes, render diffs and the message router.
//!
//! ```text
//! raw JSON ─► MessageEnvelope ─► MessageRouter::route ─┬─ "_page" → PageState
//!                                                      └─ blockID → BlockState
//!                                     ResponseEnvelope ◄─ diff(last, render())
//! ```

pub mod diff;
pub mod envelope;
pub mod router;

pub use diff::{apply_patch, diff, PatchOp};
pub use envelope::{MessageEnvelope, ResponseEnvelope, PAGE_BLOCK_ID};
pub use router::MessageRouter;
