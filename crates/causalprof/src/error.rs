use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("perf_event error: {0}")]
    PerfEvent(String),

    #[error("timer error: {0}")]
    Timer(String),

    #[error("signal setup error: {0}")]
    Signal(String),

    #[error("symbol resolution error: {0}")]
    SymbolResolution(String),

    #[error("invalid line spec '{0}', expected \"file:line\"")]
    InvalidLineSpec(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
