pub mod local;
pub mod types;

use std::path::Path;

use crate::error::ShadowError;
use crate::job::{CpuUsage, RawStatus};

pub use local::LocalShadow;
pub use types::{JobDescriptor, JobId};

/// The starter's view of the remote peer that hands out jobs and takes back
/// their results.
///
/// Transfer and liveness calls answer `false` on failure; only intake and
/// status reporting carry an error.
#[allow(async_fn_in_trait)]
pub trait Shadow {
    /// The next job to run, or `None` if there is nothing yet.
    async fn request_job_info(&self) -> Result<Option<JobDescriptor>, ShadowError>;

    async fn report_final_status(
        &self,
        job: JobId,
        status: RawStatus,
        usage: CpuUsage,
    ) -> Result<(), ShadowError>;

    /// Copies the shadow's `remote` file to `local`, made executable.
    async fn fetch_file(&self, remote: &str, local: &Path) -> bool;

    async fn send_file(&self, local: &Path, remote: &str) -> bool;

    async fn ping(&self) -> bool;
}
