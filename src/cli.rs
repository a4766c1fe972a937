//! Interface de linha de comando baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (submit, status, resume,
//! run, demo) e flags globais (--config, --max-retries, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use uuid::Uuid;

/// Orquestrador de extrações FHIR baseadas em coortes, tolerante a falhas.
#[derive(Debug, Parser)]
#[command(name = "extraction-jobs", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho do arquivo de configuração (padrão: `extraction.toml`).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Teto de retentativas por sub-estado, sobrescreve a configuração.
    #[arg(long, global = true)]
    pub max_retries: Option<u32>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Registra um novo job a partir de um arquivo CRTDL.
    Submit {
        /// Caminho para o CRTDL em JSON.
        #[arg(long)]
        crtdl: PathBuf,

        /// Ids de pacientes explícitos; dispensam a consulta de coorte.
        #[arg(long = "patient")]
        patients: Vec<String>,

        /// Seleciona este job antes dos jobs de prioridade normal.
        #[arg(long, default_value_t = false)]
        high_priority: bool,
    },

    /// Lista os jobs persistidos (somente leitura).
    Status {
        /// Mostra apenas este job, com suas issues.
        job_id: Option<Uuid>,
    },

    /// Reconcilia um job parado em TEMP_FAILED para que volte a rodar.
    Resume {
        job_id: Uuid,
    },

    /// Inicia os workers e processa jobs até Ctrl-C.
    Run {
        /// Encerra quando não houver mais trabalho a selecionar.
        #[arg(long, default_value_t = false)]
        until_idle: bool,
    },

    /// Executa um job de demonstração com o extrator de simulação.
    Demo {
        /// Número de pacientes sintéticos.
        #[arg(long, default_value_t = 25)]
        patients: usize,

        /// Pacientes por batch.
        #[arg(long, default_value_t = 5)]
        batch_size: usize,
    },
}
