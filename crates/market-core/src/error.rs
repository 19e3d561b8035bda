use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The referenced task id does not exist.
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// A stored value failed to decode into its domain type.
    #[error("unrecognized {column} value: {value}")]
    Decode {
        column: &'static str,
        value: String,
    },

    #[error(transparent)]
    Store(#[from] sqlx::Error),

    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::TaskNotFound(_))
    }
}
