use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::flight::{FlightError, SharedError};

/// An error that happens when resolving an asset.
///
/// The error is cheap to clone. All waiters of the same fetch share the underlying error.
#[derive(Debug, Clone, Error)]
pub enum AssetError {
    /// The bytes could not be obtained, either from the network or from disk.
    ///
    /// The source is the error reported by the fetcher and can be recovered with
    /// [`fetch_source`](Self::fetch_source).
    #[error("failed to fetch asset")]
    Fetch(#[source] SharedError),
    /// The bytes were fetched, but could not be interpreted as the requested kind of asset.
    #[error("malformed asset: {0}")]
    Decode(String),
    /// A file-backed asset was requested, but there is no local file for it.
    ///
    /// This happens when the fetched bytes could not be written to disk.
    #[error("asset is not available on disk")]
    NotPersisted,
    /// The wait of this particular caller was cancelled.
    #[error("cancelled")]
    Cancelled,
}

impl AssetError {
    /// Wraps a fetcher error.
    pub fn fetch<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Fetch(Arc::new(err))
    }

    /// Returns the error that caused a [`Fetch`](Self::Fetch) failure.
    ///
    /// Use [`downcast_ref`](std::error::Error::downcast_ref) on the result to inspect the
    /// error reported by the fetcher.
    pub fn fetch_source(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self {
            Self::Fetch(err) => Some(unwrap_shared(err.as_ref())),
            _ => None,
        }
    }
}

/// Looks through the wrappers that fetcher errors are transported in.
fn unwrap_shared<'a>(
    err: &'a (dyn std::error::Error + Send + Sync + 'static),
) -> &'a (dyn std::error::Error + Send + Sync + 'static) {
    match err.downcast_ref::<FetchFailure>() {
        Some(FetchFailure(inner)) => inner.as_ref(),
        None => err,
    }
}

/// A boxed fetcher error, as it travels through the shared computation.
#[derive(Debug, Error)]
#[error(transparent)]
pub(super) struct FetchFailure(pub(super) Box<dyn std::error::Error + Send + Sync + 'static>);

impl From<FlightError> for AssetError {
    fn from(err: FlightError) -> Self {
        match err {
            FlightError::Computation(err) => match err.downcast_ref::<AssetError>() {
                Some(err) => err.clone(),
                None => Self::Fetch(err),
            },
            FlightError::Cancelled => Self::Cancelled,
        }
    }
}

impl From<io::Error> for AssetError {
    fn from(err: io::Error) -> Self {
        Self::fetch(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("network is down")]
    struct NetworkError;

    #[test]
    fn test_fetch_source_downcast() {
        let err = AssetError::Fetch(Arc::new(FetchFailure(Box::new(NetworkError))));
        let source = err.fetch_source().unwrap();
        assert!(source.downcast_ref::<NetworkError>().is_some());

        let err = AssetError::fetch(NetworkError);
        assert!(err.fetch_source().unwrap().is::<NetworkError>());
        assert!(AssetError::NotPersisted.fetch_source().is_none());
    }

    #[test]
    fn test_from_flight_error() {
        let inner = AssetError::Decode("not an image".into());
        let err = AssetError::from(FlightError::Computation(Arc::new(inner)));
        assert!(matches!(err, AssetError::Decode(msg) if msg == "not an image"));

        let err = AssetError::from(FlightError::Computation(Arc::new(NetworkError)));
        assert!(err.fetch_source().unwrap().is::<NetworkError>());

        let err = AssetError::from(FlightError::Cancelled);
        assert!(matches!(err, AssetError::Cancelled));
    }
}
