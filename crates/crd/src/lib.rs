//! JobRun CRD - the declarative record of one pipeline invocation
//!
//! The run controller drives each JobRun from submission through a terminal
//! state by creating, observing, and tearing down a worker Pod on one of the
//! configured target clusters.

pub mod job_run;
pub mod labels;
pub mod states;

pub use job_run::*;
pub use labels::*;
pub use states::*;
