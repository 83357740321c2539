use std::path::PathBuf;

use thiserror::Error;

/// Coarse classification used when reporting failures to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Decode,
}

#[derive(Error, Debug)]
pub enum AcquireError {
    #[error("That file is too large. Pick a smaller image (<= 5MB).")]
    TooLarge { size: u64, limit: u64 },
    #[error("Failed to load image.")]
    Decode(#[source] image::ImageError),
    #[error("Image encoder unavailable.")]
    Encode(#[source] image::ImageError),
    #[error("failed to read image file: {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl AcquireError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AcquireError::TooLarge { .. } | AcquireError::Read { .. } => ErrorKind::Validation,
            AcquireError::Decode(_) | AcquireError::Encode(_) => ErrorKind::Decode,
        }
    }
}

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("failed to access settings file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid settings JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_file_is_a_validation_error() {
        let err = AcquireError::TooLarge {
            size: 6,
            limit: 5,
        };
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("too large"));
    }

    #[test]
    fn decode_failure_is_a_decode_error() {
        let source = image::load_from_memory(b"not an image").unwrap_err();
        let err = AcquireError::Decode(source);
        assert_eq!(err.kind(), ErrorKind::Decode);
        assert_eq!(err.to_string(), "Failed to load image.");
    }
}
