//! Call state machine and teardown

pub mod reaper;
pub mod state;

pub use reaper::{Reaper, TeardownReport};
pub use state::{check_initialize, check_place_call, step, CallState, Effect, Input, Step};
