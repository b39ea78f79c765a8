//! Deadline wrappers for remote round trips

use std::future::Future;
use std::time::Duration;

use auth_core::{Error, Result, classify_provider_error};

/// Run an identity provider call under `limit`, classifying its error.
pub async fn call<T>(
    limit: Duration,
    fut: impl Future<Output = identity::Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(classify_provider_error(&e)),
        Err(_) => Err(Error::Timeout(limit)),
    }
}

/// Run an already-classified operation under `limit`.
pub async fn within<T>(limit: Duration, fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::time::timeout(limit, fut)
        .await
        .unwrap_or(Err(Error::Timeout(limit)))
}
