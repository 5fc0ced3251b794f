use std::path::Path;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs the global subscriber. Keep the returned guards alive for the life of the
/// process or buffered lines are lost.
pub fn init_logging(log_dir: &str, service_name: &str) -> Result<Vec<WorkerGuard>, anyhow::Error> {
    std::fs::create_dir_all(log_dir)?;
    let rotated = rotate_logs_on_startup(log_dir, service_name)?;

    let file_appender = rolling::daily(log_dir, format!("{service_name}.log"));
    let (file_writer, file_guard) = non_blocking(file_appender);
    let (stdout_writer, stdout_guard) = non_blocking(std::io::stdout());

    let file_layer = fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true);

    let console_layer = fmt::layer()
        .with_writer(stdout_writer)
        .with_ansi(true)
        .with_target(false);

    // RUST_LOG wins over the default
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()?;

    info!("Logging initialized - logs will be written to {log_dir}/{service_name}.log");
    if let Some(backup) = rotated {
        info!("Previous log file backed up to: {backup}");
    }

    Ok(vec![file_guard, stdout_guard])
}

/// Moves last run's log aside so each run starts with a fresh file.
pub fn rotate_logs_on_startup(
    log_dir: &str,
    service_name: &str,
) -> Result<Option<String>, anyhow::Error> {
    let log_file = format!("{log_dir}/{service_name}.log");
    if !Path::new(&log_file).exists() {
        return Ok(None);
    }

    let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    let backup_file = format!("{log_dir}/{service_name}.{timestamp}.log");
    std::fs::rename(&log_file, &backup_file)?;

    Ok(Some(backup_file))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotate_moves_existing_log() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().to_str().unwrap();
        std::fs::write(dir.path().join("governor.log"), "old run").unwrap();

        let backup = rotate_logs_on_startup(log_dir, "governor").unwrap().unwrap();

        assert!(!dir.path().join("governor.log").exists());
        assert_eq!(std::fs::read_to_string(backup).unwrap(), "old run");
    }

    #[test]
    fn test_rotate_without_previous_log() {
        let dir = tempfile::tempdir().unwrap();
        let rotated = rotate_logs_on_startup(dir.path().to_str().unwrap(), "governor").unwrap();
        assert!(rotated.is_none());
    }
}
