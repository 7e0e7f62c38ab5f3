use super::models::Config;
use reqwest::Url;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Timeout must be positive: {field} = 0")]
    ZeroTimeout { field: String },

    #[error("User agent is not a valid header value: {0:?}")]
    InvalidUserAgent(String),

    #[error("Invalid proxy URL '{url}': {reason}")]
    InvalidProxy { url: String, reason: String },

    #[error("Retry interval must be a finite, non-negative number of seconds: {field} = {value}")]
    InvalidRetryInterval { field: String, value: f64 },

    #[error("Retry min_interval_secs ({min}) must be below max_interval_secs ({max})")]
    MinIntervalNotBelowMax { min: f64, max: f64 },

    #[error("Retry factor must be at least 1.0, got {0}")]
    InvalidRetryFactor(f64),

    #[error("Upload chunk size must be positive")]
    ZeroChunkSize,
}

/// Validate the entire configuration
pub fn validate(config: &Config) -> Result<(), ValidationError> {
    validate_http(config)?;
    validate_retry(config)?;
    validate_upload(config)?;
    Ok(())
}

fn validate_http(config: &Config) -> Result<(), ValidationError> {
    let http = &config.http;
    for (field, value) in [
        ("connect_timeout_secs", http.connect_timeout_secs),
        ("request_timeout_secs", http.request_timeout_secs),
    ] {
        if value == 0 {
            return Err(ValidationError::ZeroTimeout {
                field: field.to_string(),
            });
        }
    }

    if reqwest::header::HeaderValue::from_str(&http.user_agent).is_err() {
        return Err(ValidationError::InvalidUserAgent(http.user_agent.clone()));
    }

    if let Some(ref proxy) = http.proxy {
        let url = Url::parse(proxy).map_err(|e| ValidationError::InvalidProxy {
            url: proxy.clone(),
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https" | "socks5" | "socks5h") {
            return Err(ValidationError::InvalidProxy {
                url: proxy.clone(),
                reason: format!("unsupported scheme '{}'", url.scheme()),
            });
        }
    }

    Ok(())
}

fn validate_retry(config: &Config) -> Result<(), ValidationError> {
    let retry = &config.retry;
    let intervals = [
        ("min_interval_secs", retry.min_interval_secs),
        ("max_interval_secs", Some(retry.max_interval_secs)),
    ];
    for (field, value) in intervals {
        if let Some(value) = value
            && (!value.is_finite() || value < 0.0)
        {
            return Err(ValidationError::InvalidRetryInterval {
                field: field.to_string(),
                value,
            });
        }
    }

    // max 0 means "default", so only compare against an explicit max
    if let Some(min) = retry.min_interval_secs
        && retry.max_interval_secs > 0.0
        && min >= retry.max_interval_secs
    {
        return Err(ValidationError::MinIntervalNotBelowMax {
            min,
            max: retry.max_interval_secs,
        });
    }

    if !retry.factor.is_finite() || retry.factor < 1.0 {
        return Err(ValidationError::InvalidRetryFactor(retry.factor));
    }

    Ok(())
}

fn validate_upload(config: &Config) -> Result<(), ValidationError> {
    if config.upload.chunk_size.as_u64() == 0 {
        return Err(ValidationError::ZeroChunkSize);
    }
    Ok(())
}
