use thiserror::Error;

pub type Result<T> = std::result::Result<T, GridError>;

#[derive(Debug, Error)]
pub enum GridError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("WebDriver error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Malformed WebDriver response: {0}")]
    Protocol(String),
}

impl From<reqwest::Error> for GridError {
    fn from(err: reqwest::Error) -> Self {
        GridError::Network(err.to_string())
    }
}
