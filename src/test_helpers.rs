// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Helpers shared by the unit tests.

use log::{Level, LevelFilter, Log, Metadata, Record};
use std::sync::{Mutex, Once};

static INSTALL: Once = Once::new();
static LOGGER: CapturingLogger = CapturingLogger;
static RECORDS: Mutex<Vec<(Level, String)>> = Mutex::new(Vec::new());

/// Logger that captures every record so tests can assert on them. Tests
/// run concurrently in one process, so assertions should match on a
/// payload unique to the test.
struct CapturingLogger;

impl Log for CapturingLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        let mut records = RECORDS.lock().unwrap();
        records.push((record.level(), record.args().to_string()));
    }

    fn flush(&self) {}
}

/// Installs the capturing logger. Safe to call from every test.
pub fn install_logger() {
    INSTALL.call_once(|| {
        log::set_logger(&LOGGER).unwrap();
        log::set_max_level(LevelFilter::Trace);
    });
}

/// Counts captured error-level records containing `needle`.
pub fn error_records_containing(needle: &str) -> usize {
    let records = RECORDS.lock().unwrap();
    records
        .iter()
        .filter(|(level, message)| *level == Level::Error && message.contains(needle))
        .count()
}
