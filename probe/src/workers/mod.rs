//! The per-test child workers supervised by the execution state machine:
//! storage fetch, vault credential fetch, and the scenario run. Each worker
//! is a task with a mailbox; progress and failures travel back to the state
//! machine as messages, never as panics across the task boundary.

pub mod scenario;
pub mod storage;
pub mod vault;
