use std::{
    backtrace::{Backtrace, BacktraceStatus},
    fmt, io, result,
};

use tracing_subscriber::EnvFilter;

/// Tool-level error used by the binaries, the recorder and the file based
/// helpers (configs, manifests, caches).
///
/// Decoding itself reports [`crate::status::Status`] values; those convert
/// into `Error` through the blanket `From` implementation below, so `?` can
/// be used freely at the tool layer.
pub struct Error {
    error: String,
    backtrace: Backtrace,
}

impl Error {
    fn new(error: String) -> Self {
        Self {
            error,
            backtrace: Backtrace::capture(),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;
        if self.backtrace.status() == BacktraceStatus::Captured {
            write!(f, "\nBacktrace:\n{}", self.backtrace)
        } else {
            Ok(())
        }
    }
}

impl<E: fmt::Display> From<E> for Error {
    fn from(e: E) -> Error {
        Error::new(e.to_string())
    }
}

pub type Result<T> = result::Result<T, Error>;

/// Install the `tracing` subscriber used by the command-line tools.
///
/// The filter comes from `RUST_LOG` and defaults to `warn`. Output goes to
/// stderr so that decoded instructions on stdout stay machine readable.
pub fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    // A second initialization (tests running several tools in one process)
    // is harmless, keep the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}
