//! A `log` sink for unit tests that keeps every record in memory.

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use log::{Level, LevelFilter};
use spin::{Mutex, Once};

struct TestLogger {
    records: Mutex<Vec<(Level, String)>>,
}

static LOGGER: Once<TestLogger> = Once::new();

/// Installs the capturing logger. Safe to call from every test.
pub fn init() {
    let logger = LOGGER.call_once(|| TestLogger {
        records: Mutex::new(Vec::new()),
    });

    // Fails once the first test has installed it.
    if log::set_logger(logger).is_ok() {
        #[cfg(debug_assertions)]
        log::set_max_level(LevelFilter::Trace);

        #[cfg(not(debug_assertions))]
        log::set_max_level(LevelFilter::Info);
    }
}

/// Returns true if any record at `level` contains `needle`.
pub fn contains(level: Level, needle: &str) -> bool {
    LOGGER.get().is_some_and(|logger| {
        logger
            .records
            .lock()
            .iter()
            .any(|(l, message)| *l == level && message.contains(needle))
    })
}

impl log::Log for TestLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        self.records
            .lock()
            .push((record.level(), record.args().to_string()));
    }

    fn flush(&self) {}
}
