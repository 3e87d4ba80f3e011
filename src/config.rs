//! Configuração do starter carregada a partir de `starter.toml`.
//!
//! Todo campo tem um valor padrão, então um arquivo parcial (ou nenhum) funciona.
//! `STARTER_EXECUTE` e `STARTER_SPOOL` têm precedência sobre o arquivo; a
//! linha de comando tem precedência sobre ambos.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

const DEFAULT_FILE: &str = "starter.toml";

/// Configuração de nível superior.
#[derive(Debug, Clone, Deserialize)]
pub struct StarterConfig {
    /// Diretório pai dos diretórios de trabalho de cada job.
    #[serde(default = "default_execute_dir")]
    pub execute_dir: PathBuf,

    /// Spool do shadow local.
    #[serde(default = "default_spool_dir")]
    pub spool_dir: PathBuf,

    /// Quantas vezes tentar buscar um executável no shadow.
    #[serde(default = "default_exec_transfer_attempts")]
    pub exec_transfer_attempts: u32,

    /// Período da verificação de keep-alive do shadow.
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,

    #[serde(default = "default_min_ckpt_interval_secs")]
    pub min_ckpt_interval_secs: u64,

    #[serde(default = "default_max_ckpt_interval_secs")]
    pub max_ckpt_interval_secs: u64,

    /// Prazo para um job desalojado fazer checkpoint e sair.
    #[serde(default = "default_ckpt_timeout_secs")]
    pub ckpt_timeout_secs: u64,

    /// Prazo para um job morto desaparecer.
    #[serde(default = "default_vacate_timeout_secs")]
    pub vacate_timeout_secs: u64,

    /// Primeiro intervalo antes de pedir um job ao shadow novamente.
    #[serde(default = "default_intake_retry_min_secs")]
    pub intake_retry_min_secs: u64,

    #[serde(default = "default_intake_retry_max_secs")]
    pub intake_retry_max_secs: u64,
}

fn default_execute_dir() -> PathBuf {
    PathBuf::from("execute")
}

fn default_spool_dir() -> PathBuf {
    PathBuf::from("spool")
}

fn default_exec_transfer_attempts() -> u32 {
    3
}

fn default_keepalive_secs() -> u64 {
    300
}

fn default_min_ckpt_interval_secs() -> u64 {
    1800
}

fn default_max_ckpt_interval_secs() -> u64 {
    7200
}

fn default_ckpt_timeout_secs() -> u64 {
    300
}

fn default_vacate_timeout_secs() -> u64 {
    60
}

fn default_intake_retry_min_secs() -> u64 {
    5
}

fn default_intake_retry_max_secs() -> u64 {
    300
}

impl Default for StarterConfig {
    fn default() -> Self {
        Self {
            execute_dir: default_execute_dir(),
            spool_dir: default_spool_dir(),
            exec_transfer_attempts: default_exec_transfer_attempts(),
            keepalive_secs: default_keepalive_secs(),
            min_ckpt_interval_secs: default_min_ckpt_interval_secs(),
            max_ckpt_interval_secs: default_max_ckpt_interval_secs(),
            ckpt_timeout_secs: default_ckpt_timeout_secs(),
            vacate_timeout_secs: default_vacate_timeout_secs(),
            intake_retry_min_secs: default_intake_retry_min_secs(),
            intake_retry_max_secs: default_intake_retry_max_secs(),
        }
    }
}

impl StarterConfig {
    /// Carrega `path`, ou `starter.toml` no diretório atual quando nenhum
    /// caminho é dado. Arquivo padrão ausente significa todos os padrões;
    /// arquivo explícito ausente é um erro.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_FILE).exists() => Self::from_file(Path::new(DEFAULT_FILE))?,
            None => Self::default(),
        };

        if let Ok(dir) = std::env::var("STARTER_EXECUTE")
            && !dir.is_empty()
        {
            config.execute_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("STARTER_SPOOL")
            && !dir.is_empty()
        {
            config.spool_dir = PathBuf::from(dir);
        }

        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn min_ckpt_interval(&self) -> Duration {
        Duration::from_secs(self.min_ckpt_interval_secs)
    }

    pub fn max_ckpt_interval(&self) -> Duration {
        Duration::from_secs(self.max_ckpt_interval_secs)
    }

    pub fn ckpt_timeout(&self) -> Duration {
        Duration::from_secs(self.ckpt_timeout_secs)
    }

    pub fn vacate_timeout(&self) -> Duration {
        Duration::from_secs(self.vacate_timeout_secs)
    }

    pub fn intake_retry_min(&self) -> Duration {
        Duration::from_secs(self.intake_retry_min_secs)
    }

    pub fn intake_retry_max(&self) -> Duration {
        Duration::from_secs(self.intake_retry_max_secs)
    }
}
