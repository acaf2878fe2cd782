use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("required input artifact missing: {}", .0.display())]
    InputMissing(PathBuf),

    #[error("a geocoding batch is already in flight for this job")]
    BatchInFlight,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}
