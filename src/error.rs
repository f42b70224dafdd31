use std::error::Error as StdError;
use thiserror::Error;

type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Failure taxonomy shared by the tracking core.
#[derive(Debug, Error)]
pub enum TrackerError {
    /// A record is missing a required field or carries an impossible value.
    /// Raised before anything is written.
    #[error("invalid record: {0}")]
    Validation(String),

    /// The storage backend could not complete a read or write.
    #[error("{context}: {source}")]
    Persistence {
        context: String,
        #[source]
        source: BoxError,
    },

    #[error("{kind} `{key}` not found")]
    NotFound { kind: &'static str, key: String },
}

pub type Result<T, E = TrackerError> = std::result::Result<T, E>;

impl TrackerError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(kind: &'static str, key: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            key: key.into(),
        }
    }
}

/// Attaches a context string to backend errors, turning them into
/// [`TrackerError::Persistence`].
pub trait PersistenceContext<T> {
    fn or_persistence<C, F>(self, context: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C;
}

impl<T, E> PersistenceContext<T> for std::result::Result<T, E>
where
    E: Into<BoxError>,
{
    fn or_persistence<C, F>(self, context: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C,
    {
        self.map_err(|err| TrackerError::Persistence {
            context: context().into(),
            source: err.into(),
        })
    }
}
