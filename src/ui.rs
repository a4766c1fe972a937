//! Interface de terminal: tabela de jobs, barra de progresso e saída colorida.
//!
//! Usa as crates `indicatif` para a barra de progresso dos batches e `console`
//! para estilização com cores.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::state_machine::{Job, JobStatus, Severity};

/// Verde para sucesso, vermelho para falha, amarelo para o resto.
pub fn status_style(status: JobStatus) -> Style {
    match status {
        JobStatus::Completed => Style::new().green().bold(),
        JobStatus::Failed | JobStatus::Cancelled => Style::new().red().bold(),
        JobStatus::TempFailed => Style::new().yellow().bold(),
        _ => Style::new().cyan(),
    }
}

fn severity_style(severity: Severity) -> Style {
    match severity {
        Severity::Success => Style::new().green(),
        Severity::Info => Style::new().dim(),
        Severity::Warning => Style::new().yellow(),
        Severity::Error | Severity::Fatal => Style::new().red().bold(),
    }
}

fn done_batches(job: &Job) -> usize {
    job.batches
        .values()
        .filter(|batch| batch.status().is_done())
        .count()
}

/// Uma linha da tabela de status.
pub fn format_job_row(job: &Job) -> String {
    let status = format!("{:<22}", job.status.to_string());
    format!(
        "{}  {}  {:<6}  {:>5.1}%  {:>4}/{:<4}  {:>3} issues",
        job.id,
        status_style(job.status).apply_to(status),
        job.priority.to_string(),
        job.calculate_batch_progress(),
        done_batches(job),
        job.batches.len(),
        job.issues.len(),
    )
}

pub fn print_job_table(jobs: &[Job]) {
    if jobs.is_empty() {
        println!("No jobs found.");
        return;
    }
    let header = Style::new().bold();
    println!(
        "{}",
        header.apply_to(format!(
            "{:<36}  {:<22}  {:<6}  {:>6}  {:^9}  {:>10}",
            "JOB", "STATUS", "PRIO", "PROG", "BATCHES", "ISSUES"
        ))
    );
    for job in jobs {
        println!("{}", format_job_row(job));
    }
}

/// Detalhes de um job, incluindo todas as issues registradas.
pub fn print_job_detail(job: &Job) {
    println!("{}", format_job_row(job));
    println!("  started:  {}", job.started_at.to_rfc3339());
    println!("  updated:  {}", job.updated_at.to_rfc3339());
    if let Some(finished) = job.finished_at {
        println!("  finished: {}", finished.to_rfc3339());
    }
    println!(
        "  cohort: {} ({} patients)  core: {}",
        job.cohort_state.status, job.cohort_size, job.core_state.status
    );
    print_issues(job);
}

pub fn print_issues(job: &Job) {
    if job.issues.is_empty() {
        return;
    }
    println!("  issues:");
    for issue in &job.issues {
        let style = severity_style(issue.severity);
        println!("    {} {}", style.apply_to(format!("[{}]", issue.severity)), issue.message);
        if !issue.diagnostics.is_empty() {
            println!("      {}", Style::new().dim().apply_to(&issue.diagnostics));
        }
    }
}

/// Barra de progresso de um job acompanhando batches concluídos.
pub struct BatchProgress {
    pb: ProgressBar,
}

impl BatchProgress {
    pub fn start(job: &Job) -> Self {
        let pb = ProgressBar::new(job.batches.len() as u64);
        let style = ProgressStyle::with_template("{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} batches  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-");
        pb.set_style(style);
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        let progress = Self { pb };
        progress.update(job);
        progress
    }

    /// Atualiza posição e mensagem a partir do snapshot atual do job.
    pub fn update(&self, job: &Job) {
        self.pb.set_length(job.batches.len() as u64);
        self.pb.set_position(done_batches(job) as u64);
        self.pb.set_message(job.status.to_string());
    }

    /// Finaliza a barra e mostra o status final em cores.
    pub fn finish(&self, job: &Job) {
        self.update(job);
        self.pb.finish_and_clear();
        let marker = match job.status {
            JobStatus::Completed => status_style(job.status).apply_to("✓"),
            _ => status_style(job.status).apply_to("✗"),
        };
        println!("  {marker} Job {} finished as {}", job.id, status_style(job.status).apply_to(job.status));
    }
}
