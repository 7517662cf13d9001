use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use env_logger::{Builder, Env, Target};

use crate::config::LoggingConfig;

/// Writes every log line to stderr and, when configured, appends it to a file.
struct Tee {
    file: Option<File>,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        if let Some(file) = self.file.as_mut() {
            if let Err(err) = file.write_all(buf) {
                // Keep logging to stderr even if the disk fills up.
                let _ = writeln!(io::stderr(), "log file write failed: {err}");
                self.file = None;
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
        }
        Ok(())
    }
}

fn open_log_file(path: &Path) -> Option<File> {
    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => Some(file),
        Err(err) => {
            eprintln!("could not open log file {path:?}: {err}");
            None
        }
    }
}

/// `RUST_LOG` overrides the configured filter.
pub fn init(config: &LoggingConfig) {
    let file = config.file.as_deref().and_then(open_log_file);
    let mut builder = Builder::from_env(Env::default().default_filter_or(config.filter.as_str()));
    builder.target(Target::Pipe(Box::new(Tee { file })));
    if let Err(err) = builder.try_init() {
        eprintln!("logger already initialised: {err}");
    }
}
