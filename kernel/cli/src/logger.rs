// Copyright (C) 2019-2021  Pierre Krieger
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Prints log records to stdout.

use std::{borrow::Cow, io::Write as _};

/// Implementation of [`log::Log`] writing to the terminal.
pub struct TerminalLogger {
    /// If true, enable terminal colors when printing the log messages.
    enable_colors: bool,
    level: log::LevelFilter,
}

impl TerminalLogger {
    /// Initializes a logger printing records up to `level`.
    pub fn new(level: log::LevelFilter) -> Self {
        TerminalLogger {
            enable_colors: atty::is(atty::Stream::Stdout),
            level,
        }
    }

    /// Registers this logger as the global logger.
    pub fn install(self) -> Result<(), log::SetLoggerError> {
        let level = self.level;
        log::set_boxed_logger(Box::new(self))?;
        log::set_max_level(level);
        Ok(())
    }
}

impl log::Log for TerminalLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        // Remove any control character from log messages, in order to prevent them from
        // polluting the terminal.
        let message = record.args().to_string();
        let message = if message.chars().any(|c| c.is_control()) {
            Cow::Owned(message.chars().filter(|c| !c.is_control()).collect())
        } else {
            Cow::Borrowed(&message[..])
        };

        let mut header_style = ansi_term::Style::default();
        let level = match record.level() {
            log::Level::Error => "ERR ",
            log::Level::Warn => "WARN",
            log::Level::Info => "INFO",
            log::Level::Debug => "DEBG",
            log::Level::Trace => "TRCE",
        };
        if self.enable_colors {
            header_style.is_dimmed = true;
        }

        println!(
            "{}[{}] [{}]{} {}",
            header_style.prefix(),
            record.target(),
            level,
            header_style.suffix(),
            message
        );
    }

    fn flush(&self) {
        let _ = std::io::stdout().flush();
    }
}
