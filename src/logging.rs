// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Log destination selection.
//!
//! A single environment variable, `V4L2VA_LOG`, controls logging: `"1"`
//! sends records to stderr, any other non-empty value is treated as a file
//! path to append to. Unset or empty leaves logging disabled. No other
//! environment is consulted.

use std::env;
use std::fs::File;
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Mutex;
use std::sync::Once;

const LOG_ENV_VAR: &str = "V4L2VA_LOG";

static INIT: Once = Once::new();

/// Installs the process-wide logger the first time it is called; later calls
/// are no-ops so every entry point can invoke it unconditionally.
pub(crate) fn init_from_env() {
    INIT.call_once(|| {
        let Ok(destination) = env::var(LOG_ENV_VAR) else {
            return;
        };
        if destination.is_empty() {
            return;
        }

        if destination == "1" {
            let _ = env_logger::Builder::new()
                .filter_level(log::LevelFilter::Debug)
                .target(env_logger::Target::Stderr)
                .try_init();
            return;
        }

        match OpenOptions::new().create(true).append(true).open(&destination) {
            Ok(file) => {
                if log::set_boxed_logger(Box::new(FileLogger { file: Mutex::new(file) })).is_ok() {
                    log::set_max_level(log::LevelFilter::Debug);
                }
            }
            Err(_) => {
                // Unwritable path: fall back to stderr rather than dropping
                // records on the floor.
                let _ = env_logger::Builder::new()
                    .filter_level(log::LevelFilter::Debug)
                    .target(env_logger::Target::Stderr)
                    .try_init();
            }
        }
    });
}

struct FileLogger {
    file: Mutex<File>,
}

impl log::Log for FileLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(
                file,
                "[{}] {} {}: {}",
                std::process::id(),
                record.level(),
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {
        if let Ok(mut file) = self.file.lock() {
            let _ = file.flush();
        }
    }
}
