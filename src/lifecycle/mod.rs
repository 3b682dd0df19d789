//! Program lifecycle
//!
//! Programs scope cumulative statistics: starting one resets them, ending one
//! recomputes its lifetime totals from stored history. The schedule drives
//! switches, and startup recovery closes programs a crash left open.

mod manager;
mod recovery;
pub mod schedule;
mod totals;

pub use manager::{ActiveProgram, LifecycleError, LifecycleManager, Notification};
pub use recovery::{recover_open_programs, RecoveryReport};
pub use schedule::{ProgramSchedule, ScheduleEntry, ScheduleError, ScheduleFile};
pub use totals::{finalize_program, recompute_program, ProgramTotals};
