pub mod task;
pub use task::Task;

pub mod timer;
pub use timer::{Timer, TimerType};

pub mod watchdog;
pub use watchdog::HandlerGuard;
