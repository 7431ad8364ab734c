//! Everything that touches GAP itself: script text, command lines and the
//! process runner.

pub mod launcher;
pub mod paths;
pub mod script;

pub use launcher::{
    is_progress_line, tail_lines, Echo, GapEnvironment, GapInvocation, Launcher, RunOutcome,
};
pub use script::DedupMethod;
