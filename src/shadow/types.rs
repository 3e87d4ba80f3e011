//! Tipos de dados trocados com o shadow.
//!
//! Um [`JobDescriptor`] é o que o shadow entrega na admissão. Um
//! [`FinalStatus`] é o que o starter devolve quando um processo do job é
//! descartado.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};

use crate::error::ShadowError;
use crate::job::{CpuUsage, JobClass, RawStatus};

/// Identidade de um processo do job: cluster e número do proc.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId {
    pub cluster: i32,
    #[serde(rename = "proc")]
    pub proc_id: i32,
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.cluster, self.proc_id)
    }
}

/// Tudo que o starter precisa para executar um processo do job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    /// Número do cluster atribuído pelo escalonador.
    pub cluster: i32,
    /// Número do processo dentro do cluster.
    #[serde(rename = "proc")]
    pub proc_id: i32,
    /// Tipo de job, que decide como ele é iniciado e verificado.
    #[serde(default)]
    pub job_class: JobClass,
    /// Dono sob o qual executar quando o starter roda como root.
    #[serde(default)]
    pub uid: Option<u32>,
    #[serde(default)]
    pub gid: Option<u32>,
    /// Pid que o job enxerga para si mesmo entre reinícios.
    #[serde(default)]
    pub virtual_pid: i32,
    /// Sinal que pede ao job para sair por conta própria, ex. `"SIGTERM"`.
    #[serde(default = "default_soft_kill_signal")]
    pub soft_kill_signal: String,
    /// Executável. Um caminho absoluto executável neste host é ligado no
    /// lugar; qualquer outro é buscado no shadow.
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Ambiente completo do job.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Diretório de trabalho inicial.
    #[serde(default = "default_iwd")]
    pub iwd: PathBuf,
    /// Se o job faz checkpoints periódicos.
    #[serde(default)]
    pub checkpoint_wanted: bool,
    /// Se o executável é um checkpoint a partir do qual reiniciar.
    #[serde(default)]
    pub is_restart: bool,
    /// Maior arquivo core, em bytes, que o job pode deixar.
    #[serde(default)]
    pub core_limit: Option<u64>,
    #[serde(default)]
    pub stdin: Option<PathBuf>,
    #[serde(default)]
    pub stdout: Option<PathBuf>,
    #[serde(default)]
    pub stderr: Option<PathBuf>,
}

fn default_soft_kill_signal() -> String {
    "SIGTERM".to_string()
}

fn default_iwd() -> PathBuf {
    PathBuf::from("/tmp")
}

impl JobDescriptor {
    pub fn job_id(&self) -> JobId {
        JobId {
            cluster: self.cluster,
            proc_id: self.proc_id,
        }
    }

    pub fn soft_kill(&self) -> Result<Signal, ShadowError> {
        Signal::from_str(&self.soft_kill_signal).map_err(|_| {
            ShadowError::InvalidJob(format!("unknown signal {}", self.soft_kill_signal))
        })
    }

    /// Rejeita descritores com os quais o starter não conseguiria agir.
    pub fn validate(&self) -> Result<(), ShadowError> {
        if self.cmd.trim().is_empty() {
            return Err(ShadowError::InvalidJob(format!("job {} has no cmd", self.job_id())));
        }
        if self.cluster < 0 || self.proc_id < 0 {
            return Err(ShadowError::InvalidJob(format!(
                "job {} has a negative id",
                self.job_id()
            )));
        }
        self.soft_kill()?;
        Ok(())
    }
}

/// Registro anexado para cada processo do job descartado.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalStatus {
    pub job: JobId,
    /// Palavra de status de wait no estilo BSD.
    pub raw_status: i32,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub core_dumped: bool,
    pub usage: CpuUsage,
    pub reported_at: DateTime<Utc>,
}

impl FinalStatus {
    pub fn new(job: JobId, status: RawStatus, usage: CpuUsage) -> Self {
        Self {
            job,
            raw_status: status.0,
            exit_code: status.exit_code(),
            signal: status.signal(),
            core_dumped: status.core_dumped(),
            usage,
            reported_at: Utc::now(),
        }
    }
}
