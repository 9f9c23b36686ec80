use std::path::PathBuf;

/// Errors produced by the fuzzing library.
///
/// `Init` covers everything that can go wrong before the first fuzzing
/// iteration; `Harness` covers fork server channel failures at run time.
/// Timeouts and target crashes are observations, not errors, and never
/// surface here.
#[derive(Debug, thiserror::Error)]
pub enum FuzzerError {
    #[error("initialization failed: {0}")]
    Init(String),

    #[error("fork server failure: {0}")]
    Harness(String),

    #[error("dictionary {path}, line {line}: {reason}")]
    Dictionary {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Os(#[from] nix::errno::Errno),

    #[error(transparent)]
    SharedMemory(#[from] libafl_bolts::Error),

    #[error("failed to serialize stats: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl FuzzerError {
    pub fn init<S: Into<String>>(message: S) -> Self {
        Self::Init(message.into())
    }

    pub fn harness<S: Into<String>>(message: S) -> Self {
        Self::Harness(message.into())
    }
}

pub type Result<T> = std::result::Result<T, FuzzerError>;
