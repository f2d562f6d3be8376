use std::{io, result::Result as StdResult};

use thiserror::Error;

pub type Result<T> = StdResult<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("event loop `{0}` was already started")]
    LoopStarted(String),

    #[error("{component} is {actual}, expected {expected}")]
    InvalidState {
        component: &'static str,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("failed to spawn thread `{name}`: {source}")]
    ThreadSpawn {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("pre-start hook failed on `{0}`")]
    HookFailed(String),
}

impl Error {
    pub(crate) fn invalid_state(
        component: &'static str,
        expected: &'static str,
        actual: &'static str,
    ) -> Self {
        Error::InvalidState {
            component,
            expected,
            actual,
        }
    }
}
