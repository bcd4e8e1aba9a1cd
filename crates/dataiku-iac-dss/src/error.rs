//! DSS client error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DssError {
    #[error("DSS URL is not configured. Set dss.url in settings.yaml or DATAIKU_IAC_DSS_URL")]
    MissingUrl,

    #[error("Invalid DSS URL '{url}': {message}")]
    InvalidUrl { url: String, message: String },

    #[error("Missing environment variable: {0}")]
    MissingApiKey(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, DssError>;
