use thiserror::Error;

use crate::env::session::SessionError;

/// Worker-fatal failures. Session faults may instead be downgraded to a
/// datapoint skip depending on the configured fault policy.
#[derive(Debug, Error)]
pub enum TrainError {
    #[error("session fault: {0}")]
    Session(#[from] SessionError),
    #[error("tensor store failure: {0}")]
    Tch(#[from] tch::TchError),
    #[error("checkpoint io: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
}
