//! Error taxonomy for the import engine

use thiserror::Error;

use crate::store::StoreError;

pub type Result<T> = std::result::Result<T, ImportError>;

#[derive(Error, Debug)]
pub enum ImportError {
    /// The CSV cannot be read against the derived schema. Aborts the job.
    #[error("line {line}: {message}")]
    FatalParse { line: u64, message: String },

    /// A single row failed; the job continues with the next row.
    #[error("{message}")]
    Row { message: String },

    /// No match-role column carried a value in this row.
    #[error("no identifying column (tried: {tried}) has a value")]
    MissingIdentity { tried: String },

    /// A raw cell could not be coerced into the column's value type.
    #[error("column {column}: cannot read {value:?} as {expected}")]
    Conversion {
        column: String,
        value: String,
        expected: &'static str,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("the field type {0} is already registered")]
    DuplicateFieldType(String),

    #[error("unknown field type: {0}")]
    UnknownFieldType(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ImportError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Row-level errors never escalate to a job failure.
    pub fn is_row_level(&self) -> bool {
        matches!(
            self,
            Self::Row { .. } | Self::MissingIdentity { .. } | Self::Conversion { .. } | Self::Store(_)
        )
    }
}
