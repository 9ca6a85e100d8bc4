// Application intake: validation guards, quota, lifecycle transitions, and
// the user-facing handlers. Everything that mutates auto_applications goes
// through lifecycle.rs so status changes stay conditional and sequential.

pub mod handlers;
pub mod lifecycle;
pub mod quota;
pub mod target;
