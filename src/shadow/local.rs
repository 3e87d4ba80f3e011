//! Shadow baseado em um diretório de spool.
//!
//! Estrutura do spool:
//! - `job.toml`: o próximo job, consumido na admissão e renomeado para
//!   `job.<cluster>.<proc>.claimed`;
//! - `status.jsonl`: um [`FinalStatus`] por linha, anexado no descarte;
//! - qualquer outro arquivo: acessível por nome relativo via `fetch_file` e
//!   `send_file`.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::Shadow;
use super::types::{FinalStatus, JobDescriptor, JobId};
use crate::error::ShadowError;
use crate::job::{CpuUsage, RawStatus};

const JOB_FILE: &str = "job.toml";
const STATUS_FILE: &str = "status.jsonl";
const EXECUTABLE_MODE: u32 = 0o755;

pub struct LocalShadow {
    spool: PathBuf,
}

impl LocalShadow {
    pub fn new(spool: impl Into<PathBuf>) -> Self {
        Self {
            spool: spool.into(),
        }
    }

    pub fn spool(&self) -> &Path {
        &self.spool
    }

    pub fn status_path(&self) -> PathBuf {
        self.spool.join(STATUS_FILE)
    }

    /// Nomes relativos ficam no spool, absolutos são usados como estão.
    fn resolve(&self, remote: &str) -> PathBuf {
        let path = Path::new(remote);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.spool.join(path)
        }
    }

    /// Todos os status reportados até agora.
    #[cfg(test)]
    pub(crate) async fn reported(&self) -> Result<Vec<FinalStatus>, ShadowError> {
        let contents = match fs::read_to_string(self.status_path()).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(ShadowError::from))
            .collect()
    }
}

impl Shadow for LocalShadow {
    async fn request_job_info(&self) -> Result<Option<JobDescriptor>, ShadowError> {
        let path = self.spool.join(JOB_FILE);
        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no job waiting");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let desc: JobDescriptor = toml::from_str(&contents)?;
        desc.validate()?;

        let id = desc.job_id();
        let claimed = self
            .spool
            .join(format!("job.{}.{}.claimed", id.cluster, id.proc_id));
        fs::rename(&path, &claimed).await?;
        info!(job = %id, cmd = %desc.cmd, "claimed job");
        Ok(Some(desc))
    }

    async fn report_final_status(
        &self,
        job: JobId,
        status: RawStatus,
        usage: CpuUsage,
    ) -> Result<(), ShadowError> {
        let record = FinalStatus::new(job, status, usage);
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.status_path())
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        info!(%job, %status, "final status reported");
        Ok(())
    }

    async fn fetch_file(&self, remote: &str, local: &Path) -> bool {
        let source = self.resolve(remote);
        let copied = async {
            fs::copy(&source, local).await?;
            fs::set_permissions(local, std::fs::Permissions::from_mode(EXECUTABLE_MODE)).await
        };
        match copied.await {
            Ok(()) => true,
            Err(e) => {
                warn!(from = %source.display(), to = %local.display(), error = %e, "fetch failed");
                false
            }
        }
    }

    async fn send_file(&self, local: &Path, remote: &str) -> bool {
        let dest = self.resolve(remote);
        let sent = async {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::copy(local, &dest).await
        };
        match sent.await {
            Ok(bytes) => {
                debug!(from = %local.display(), to = %dest.display(), bytes, "file sent");
                true
            }
            Err(e) => {
                warn!(from = %local.display(), to = %dest.display(), error = %e, "send failed");
                false
            }
        }
    }

    async fn ping(&self) -> bool {
        fs::metadata(&self.spool)
            .await
            .is_ok_and(|meta| meta.is_dir())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn spool() -> (TempDir, LocalShadow) {
        let dir = TempDir::new().unwrap();
        let shadow = LocalShadow::new(dir.path());
        (dir, shadow)
    }

    #[tokio::test]
    async fn intake_claims_the_job_file() {
        let (dir, shadow) = spool();
        assert!(shadow.request_job_info().await.unwrap().is_none());

        std::fs::write(
            dir.path().join("job.toml"),
            "cluster = 7\nproc = 2\ncmd = \"job.sh\"\n",
        )
        .unwrap();
        let desc = shadow.request_job_info().await.unwrap().unwrap();
        assert_eq!(desc.job_id(), JobId { cluster: 7, proc_id: 2 });
        assert!(!dir.path().join("job.toml").exists());
        assert!(dir.path().join("job.7.2.claimed").exists());

        // Jobs já reivindicados não são entregues duas vezes.
        assert!(shadow.request_job_info().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn invalid_job_is_an_error() {
        let (dir, shadow) = spool();
        std::fs::write(dir.path().join("job.toml"), "cluster = 1\nproc = 0\ncmd = \"\"\n").unwrap();
        assert!(matches!(
            shadow.request_job_info().await,
            Err(ShadowError::InvalidJob(_))
        ));

        std::fs::write(dir.path().join("job.toml"), "not toml at all [").unwrap();
        assert!(matches!(
            shadow.request_job_info().await,
            Err(ShadowError::Toml(_))
        ));
    }

    #[tokio::test]
    async fn statuses_append_as_json_lines() {
        let (_dir, shadow) = spool();
        let a = JobId { cluster: 1, proc_id: 0 };
        let b = JobId { cluster: 1, proc_id: 1 };
        shadow
            .report_final_status(a, RawStatus::exited(0), CpuUsage::default())
            .await
            .unwrap();
        shadow
            .report_final_status(b, RawStatus::exited(3), CpuUsage::default())
            .await
            .unwrap();

        let reported = shadow.reported().await.unwrap();
        assert_eq!(reported.len(), 2);
        assert_eq!(reported[0].job, a);
        assert_eq!(reported[1].exit_code, Some(3));
    }

    #[tokio::test]
    async fn fetch_makes_the_copy_executable() {
        let (dir, shadow) = spool();
        std::fs::write(dir.path().join("job.sh"), "#!/bin/sh\nexit 0\n").unwrap();
        let dest = dir.path().join("condor_exec.1.0");

        assert!(shadow.fetch_file("job.sh", &dest).await);
        let mode = std::fs::metadata(&dest).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, EXECUTABLE_MODE);

        assert!(!shadow.fetch_file("missing.sh", &dest).await);
    }

    #[tokio::test]
    async fn send_creates_parent_directories() {
        let (dir, shadow) = spool();
        let core = dir.path().join("core.123");
        std::fs::write(&core, b"core").unwrap();

        assert!(shadow.send_file(&core, "cores/core.1.0").await);
        assert_eq!(std::fs::read(dir.path().join("cores/core.1.0")).unwrap(), b"core");
    }

    #[tokio::test]
    async fn ping_tracks_the_spool() {
        let (dir, shadow) = spool();
        assert!(shadow.ping().await);
        drop(dir);
        assert!(!shadow.ping().await);
    }
}
