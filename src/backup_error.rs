use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("cannot connect to pool \"{0}\": {1}")]
    Connect(String, String),
    #[error("pool \"{0}\" is scrubbing")]
    PoolBusy(String),
    #[error("volume not found: {0}")]
    NotFound(String),
    #[error("snapshot \"{0}\" is protected")]
    Protected(String),
    #[error("transfer failed: {0}")]
    Transfer(String),
    #[error("cannot quiesce guest: {0}")]
    Quiesce(String),
    #[error("command finished with status code {code}: {stderr}")]
    Command { code: i32, stderr: String },
    #[error("command was terminated by signal")]
    Signaled,
    #[error("error parsing command output: {0}")]
    Parse(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}
