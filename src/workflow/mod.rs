//! Workflow stages and the state machine that sequences them.

mod machine;
mod stage;

pub use machine::*;
pub use stage::*;
