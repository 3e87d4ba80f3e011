//! Interface de linha de comando do starter baseada em clap.

use std::ffi::OsString;
use std::path::PathBuf;

use clap::Parser;

/// Executa um job batch entregue pelo shadow e o supervisiona até que o
/// shadow ou o dono da máquina decida o contrário.
#[derive(Debug, Parser)]
#[command(name = "starter", version, about)]
pub struct Cli {
    /// Arquivo de configuração (padrão: ./starter.toml se existir).
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Diretório de spool do shadow local.
    #[arg(long)]
    pub spool: Option<PathBuf>,

    /// Diretório pai dos arquivos de trabalho do job.
    #[arg(long)]
    pub execute: Option<PathBuf>,

    /// Log em nível debug, a menos que RUST_LOG diga outra coisa.
    #[arg(long, short, default_value_t = false)]
    pub verbose: bool,

    /// Imprime a máquina de estados como grafo Graphviz e sai.
    #[arg(long, default_value_t = false)]
    pub dot: bool,
}

impl Cli {
    /// Lê os argumentos do processo, aceitando o histórico `-dot`.
    pub fn parse_args() -> Self {
        Self::parse_from(normalize_legacy_flags(std::env::args_os()))
    }
}

/// Reescreve opções longas de um só traço anteriores a esta interface.
pub fn normalize_legacy_flags<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator,
    I::Item: Into<OsString>,
{
    args.into_iter()
        .map(Into::into)
        .map(|arg| if arg == "-dot" { OsString::from("--dot") } else { arg })
        .collect()
}
