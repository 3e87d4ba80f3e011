//! Job processes: how they are spawned, signalled, reaped and reported.

mod list;
mod status;
mod user_proc;

pub use list::ProcessList;
pub use status::{CpuUsage, RawStatus};
#[cfg(test)]
pub use status::JOB_EXEC_FAILED;
pub use user_proc::{JobClass, ProcState, UserProc};
