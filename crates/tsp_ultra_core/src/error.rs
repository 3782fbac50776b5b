use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("spectral solver failed: {0}")]
    Spectral(String),
    #[error("invalid tour: {0}")]
    InvalidTour(String),
    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::InvalidData(message.into())
    }

    pub fn spectral(message: impl Into<String>) -> Self {
        Self::Spectral(message.into())
    }

    pub fn invalid_tour(message: impl Into<String>) -> Self {
        Self::InvalidTour(message.into())
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn constructors_prefix_messages_by_kind() {
        assert_eq!(
            Error::invalid_input("k must be > 0").to_string(),
            "invalid input: k must be > 0"
        );
        assert_eq!(
            Error::spectral("no convergence").to_string(),
            "spectral solver failed: no convergence"
        );
        assert_eq!(
            Error::invalid_tour("duplicate id 3").to_string(),
            "invalid tour: duplicate id 3"
        );
    }

    #[test]
    fn io_errors_convert_transparently() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing.txt");
        let err: Error = io.into();
        assert_eq!(err.to_string(), "missing.txt");
    }
}
