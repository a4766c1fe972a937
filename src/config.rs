//! Configuração do orquestrador carregada a partir de `extraction.toml`.
//!
//! A struct [`ExtractionConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! As variáveis de ambiente `EXTRACTION_RESULTS_DIR` e `EXTRACTION_FLARE_URL`
//! têm precedência sobre o arquivo; flags da CLI têm precedência sobre ambas.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "extraction.toml";

/// Configuração de nível superior carregada de `extraction.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractionConfig {
    /// Diretório onde jobs, batches e partes do core são persistidos.
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,

    /// Número máximo de pacientes por batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Número de workers executando unidades em paralelo.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Teto de retentativas por sub-estado (cohort, batch, core).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Falhas retentáveis consecutivas de um worker antes de abortar o processo.
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,

    /// Espera após uma falha retentável no loop do worker.
    #[serde(default = "default_retry_sleep_ms")]
    pub retry_sleep_ms: u64,

    /// Espera quando nenhuma unidade de trabalho está disponível.
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,

    /// Tempo máximo aguardando workers no shutdown antes de abortá-los.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    /// URL base do FLARE. Sem ela, apenas jobs com pacientes explícitos rodam.
    #[serde(default)]
    pub flare_url: Option<String>,
}

// Valor padrão para o diretório de resultados: "output".
fn default_results_dir() -> PathBuf {
    PathBuf::from("output")
}

fn default_batch_size() -> usize {
    100
}

fn default_max_concurrency() -> usize {
    4
}

fn default_max_retries() -> u32 {
    5
}

fn default_max_consecutive_failures() -> u32 {
    30
}

fn default_retry_sleep_ms() -> u64 {
    1000
}

fn default_idle_poll_ms() -> u64 {
    200
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            results_dir: default_results_dir(),
            batch_size: default_batch_size(),
            max_concurrency: default_max_concurrency(),
            max_retries: default_max_retries(),
            max_consecutive_failures: default_max_consecutive_failures(),
            retry_sleep_ms: default_retry_sleep_ms(),
            idle_poll_ms: default_idle_poll_ms(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            flare_url: None,
        }
    }
}

impl ExtractionConfig {
    /// Carrega a configuração do caminho indicado ou de `extraction.toml` no
    /// diretório atual. Usa valores padrão se o arquivo não existir.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or(Path::new(DEFAULT_CONFIG_FILE));
        let mut config = Self::from_file(path)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str::<ExtractionConfig>(&contents)
            .with_context(|| format!("invalid configuration in {}", path.display()))
    }

    // Variáveis vazias são ignoradas.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("EXTRACTION_RESULTS_DIR")
            && !dir.is_empty()
        {
            self.results_dir = PathBuf::from(dir);
        }
        if let Some(url) = lookup("EXTRACTION_FLARE_URL")
            && !url.is_empty()
        {
            self.flare_url = Some(url);
        }
    }

    pub fn retry_sleep(&self) -> Duration {
        Duration::from_millis(self.retry_sleep_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}
