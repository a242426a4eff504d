//! Page and block state machines.
//!
//! ```text
//! PageState ─┬─ navigation (currentStep, completedSteps)
//!            ├─ codeEdits
//!            └─ blocks: id → Box<dyn BlockState>
//!                         ├─ CounterBlock
//!                         └─ SourceBlock ─► Source / ActionExecutor
//! ```

pub mod block;
pub mod page;
pub mod page_state;

pub use block::{BlockFactory, BlockState, CounterBlock, SourceBlock};
pub use page::{BlockDescriptor, BlockRole, Page, PageConfig};
pub use page_state::PageState;
