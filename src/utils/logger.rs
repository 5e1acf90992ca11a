use std::io::Write;

use log::{Level, LevelFilter, Metadata, Record};

/// Custom logger implementation for the simulator.
struct SimLogger;

impl log::Log for SimLogger {
    /// Checks if the given log level is enabled.
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    /// Logs the record by printing it to stderr.
    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let _ = writeln!(
                std::io::stderr(),
                "[{}] {}",
                record.level(),
                record.args()
            );
        }
    }

    /// Flushes the logger (no-op in this case).
    fn flush(&self) {}
}

/// The logger instance used for logging.
static LOGGER: SimLogger = SimLogger;

/// Initializes the logger.
///
/// # Arguments
///
/// * `level` - The maximum level to log; `Info` is a sensible default.
///
/// Safe to call more than once; later calls only adjust the level.
pub fn init(level: Level) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level.to_level_filter());
    } else {
        // a logger is already installed; just raise our ceiling
        log::set_max_level(LevelFilter::max().min(level.to_level_filter()));
    }
}
