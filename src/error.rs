use thiserror::Error;

/// The error type for rustconn setup operations.
///
/// Only construction and registration paths return this type. Once a
/// [`Connection`](crate::Connection) is established, transport failures are
/// never reported as errors: they are logged and turned into the close path,
/// which the application observes through its connection callback.
#[derive(Error, Debug)]
pub enum Error {
    /// Low-level I/O error from the operating system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The provided socket address could not be parsed or resolved.
    #[error("Invalid socket address")]
    InvalidAddress,

    /// Configuration file parsing or key lookup failed.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}
