//! Worker-assisted submission: the human fallback for applications
//! automation could not finish.

pub mod handlers;
pub mod queue;
