use directories::ProjectDirs;
use flexi_logger::{
    detailed_format, Cleanup, Criterion, Duplicate, FileSpec, Logger, LoggerHandle, Naming,
};

use crate::config::LoggingConfig;
use crate::error::FleetPackError;

const MAX_LOG_BYTES: u64 = 10 * 1024 * 1024;
const KEEP_LOG_FILES: usize = 5;

/// Starts file logging under the project's data dir. Warnings and errors are
/// duplicated to stderr. The returned handle must be kept alive for the
/// lifetime of the process.
pub fn setup_logging(
    project_dirs: &ProjectDirs,
    logging: &LoggingConfig,
) -> Result<LoggerHandle, FleetPackError> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    std::fs::create_dir_all(&log_dir)?;

    Logger::try_with_str(logging.log_spec())
        .and_then(|logger| {
            logger
                .log_to_file(FileSpec::default().directory(&log_dir).basename("fleetpack"))
                .rotate(
                    Criterion::Size(MAX_LOG_BYTES),
                    Naming::Timestamps,
                    Cleanup::KeepLogFiles(KEEP_LOG_FILES),
                )
                .duplicate_to_stderr(Duplicate::Warn)
                .format_for_files(detailed_format)
                .start()
        })
        .map_err(|e| FleetPackError::Error(format!("Failed to start logger: {}", e)))
}
