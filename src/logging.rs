// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Minimal logging for the command line tool. */

use log::{Level, LevelFilter, Log, Metadata, Record};

/// A logger that uses println!.
pub struct PrintlnLogger;

impl Log for PrintlnLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if record.level() <= Level::Warn {
            eprintln!("{}", record.args());
        } else {
            println!("{}", record.args());
        }
    }

    fn flush(&self) {}
}

/// Install the println logger with a level derived from `-v` counts.
pub fn install(verbosity: u64) {
    let level = match verbosity {
        0 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };

    // Installation can only happen once per process; a second attempt
    // just keeps the existing logger.
    if log::set_boxed_logger(Box::new(PrintlnLogger)).is_ok() {
        log::set_max_level(level);
    }
}
