use std::io;

use thiserror::Error;

/// The status class a failed request maps to.
///
/// A web binding translates this into the response status code, see [`StatusClass::code`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StatusClass {
    /// The resource is not available (`404`).
    NotFound,
    /// Something went wrong while producing or delivering the resource (`500`).
    ServerError,
}

impl StatusClass {
    /// The HTTP status code for this class.
    pub fn code(self) -> u16 {
        match self {
            Self::NotFound => 404,
            Self::ServerError => 500,
        }
    }

    /// A short name, used for metric tags.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::ServerError => "server_error",
        }
    }
}

/// An error returned by [`Store::get`](crate::Store::get).
///
/// Every error has a [`StatusClass`] attached to it. Storage write failures are not reported
/// through this type, they are counted on the bucket and eventually seal the key.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The key has been sealed after too many failed storage writes.
    #[error("cache bucket sealed")]
    Sealed,
    /// The slot store failed to look up the key.
    #[error("cache lookup failed")]
    LookupFailed(#[source] io::Error),
    /// The key is not cached, and there is no fetch to produce it.
    #[error("no fetch method specified")]
    NoFetch,
    /// The slot store failed to provide a writable slot.
    #[error("failed to lock a cache slot")]
    LockFailed(#[source] io::Error),
    /// The fetch signaled a failure.
    ///
    /// The attached string contains the reason reported by the fetch.
    #[error("fetch failed: {0}")]
    FetchFailed(String),
    /// Writing to the response failed midway.
    #[error("failed to deliver cached data")]
    DeliveryFailed(#[source] io::Error),
    /// An unexpected error in the store itself.
    #[error("internal error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Returns the status class of this error.
    pub fn status(&self) -> StatusClass {
        match self {
            Self::Sealed | Self::LookupFailed(_) | Self::NoFetch => StatusClass::NotFound,
            Self::LockFailed(_)
            | Self::FetchFailed(_)
            | Self::DeliveryFailed(_)
            | Self::Internal(_) => StatusClass::ServerError,
        }
    }

    /// Shorthand for `self.status().code()`.
    pub fn status_code(&self) -> u16 {
        self.status().code()
    }
}
