use std::{fmt, path::PathBuf};

use thiserror::Error;

/// Where in a fetched document a problem was observed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorLocation {
    pub document: Option<String>,
    pub json_pointer: Option<String>,
}

impl ErrorLocation {
    pub fn in_document(document: impl Into<String>) -> Self {
        ErrorLocation {
            document: Some(document.into()),
            json_pointer: None,
        }
    }

    pub fn with_json_pointer(mut self, pointer: impl Into<String>) -> Self {
        self.json_pointer = Some(pointer.into());
        self
    }

    pub fn describe(&self) -> Option<String> {
        match (&self.document, &self.json_pointer) {
            (Some(doc), Some(ptr)) => Some(format!("{doc}{ptr}")),
            (Some(doc), None) => Some(doc.clone()),
            (None, Some(ptr)) => Some(ptr.clone()),
            (None, None) => None,
        }
    }
}

impl fmt::Display for ErrorLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.describe() {
            Some(text) => f.write_str(&text),
            None => f.write_str("<unknown>"),
        }
    }
}

#[derive(Debug, Error)]
pub enum RepairError {
    #[error("data quality: {message} at {location}")]
    DataQuality {
        message: String,
        location: ErrorLocation,
    },
    #[error("{operation} failed after {attempts} attempt(s): {message}")]
    Transient {
        operation: String,
        attempts: u32,
        message: String,
    },
    #[error("{operation} returned status {status}: {body}")]
    Api {
        operation: String,
        status: u16,
        body: String,
    },
    #[error("{operation}: unexpected response: {message}")]
    Decode { operation: String, message: String },
    #[error("configuration error: {message}")]
    Config { message: String },
    #[error("io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl RepairError {
    pub fn data_quality(message: impl Into<String>, location: ErrorLocation) -> Self {
        RepairError::DataQuality {
            message: message.into(),
            location,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        RepairError::Config {
            message: message.into(),
        }
    }

    /// Fatal errors abort the whole run before any group is processed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RepairError::Config { .. })
    }
}

pub type Result<T> = std::result::Result<T, RepairError>;
