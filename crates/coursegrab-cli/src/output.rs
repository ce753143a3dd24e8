//! Terminal presentation of progress, catalog rows and run results.

use std::io::Write;

use tokio::sync::broadcast::error::RecvError;

use coursegrab::progress::{Level, ProgressEvent, ProgressReceiver};
use coursegrab::{redact, CatalogRow, RetryOutcome, RunStatus};

/// Process exit code for a finished run.
pub fn exit_code(status: RunStatus) -> i32 {
    match status {
        RunStatus::Registered | RunStatus::AlreadyRegistered => 0,
        RunStatus::Cancelled | RunStatus::BudgetExhausted => 2,
        RunStatus::BusinessRule => 3,
        RunStatus::AuthExpired => 4,
        RunStatus::FaultsExhausted
        | RunStatus::SecretUnavailable
        | RunStatus::InvalidSession
        | RunStatus::RuntimeUnavailable => 5,
    }
}

fn symbol(level: Level) -> &'static str {
    match level {
        Level::Info => "·",
        Level::Success => "✓",
        Level::Warning => "!",
        Level::Error => "✗",
    }
}

pub fn format_event(event: &ProgressEvent) -> String {
    let level = event.level();
    format!("  {} [{level}] {}", symbol(level), event.event.summary())
}

/// Print events until the channel closes.
pub async fn print_progress(mut rx: ProgressReceiver) {
    loop {
        match rx.recv().await {
            Ok(event) => println!("{}", format_event(&event)),
            Err(RecvError::Lagged(skipped)) => {
                eprintln!("  ! [WARNING] {skipped} progress events dropped");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Tabulate catalog rows. Secrets are redacted.
pub fn write_rows(out: &mut impl Write, rows: &[CatalogRow]) -> std::io::Result<()> {
    if rows.is_empty() {
        writeln!(out, "  no matching classes")?;
        return Ok(());
    }
    writeln!(out, "  {:<4} {:<24} {:<28} {:<12} SECRET", "#", "CLASS ID", "COURSE", "TEACHER")?;
    for (i, row) in rows.iter().enumerate() {
        let secret = row
            .secret
            .as_deref()
            .map(redact)
            .unwrap_or_else(|| "-".to_string());
        writeln!(
            out,
            "  {:<4} {:<24} {:<28} {:<12} {}",
            i + 1,
            row.class_id,
            row.course_name,
            row.teacher,
            secret
        )?;
    }
    Ok(())
}

pub fn summarize(outcome: &RetryOutcome) -> String {
    let mut line = format!(
        "{}: {} ({} attempts in {:.1}s)",
        outcome.status,
        outcome.message,
        outcome.attempts,
        outcome.elapsed.as_secs_f64()
    );
    if let Some(error) = outcome
        .error
        .as_deref()
        .filter(|e| !outcome.message.contains(*e))
    {
        line.push_str(&format!("\n  cause: {error}"));
    }
    line
}
