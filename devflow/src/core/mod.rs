//! Deterministic, pure logic for the pipeline stages.
//!
//! Nothing here touches the filesystem, the network or a subprocess; callers
//! pass facts in (such as whether a file exists) and get values back.

pub mod commit;
pub mod detector;
pub mod outcome;
pub mod path;
pub mod reply;
pub mod targets;
pub mod task;
pub mod text;
pub mod types;
