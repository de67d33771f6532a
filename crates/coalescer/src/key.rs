use std::fmt;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// The identifier of one cached resource.
///
/// This is the lowercase hex encoded SHA-256 digest of the request URI, which makes it safe to
/// use as a file name and spreads keys evenly over the sharded directory tree of the
/// [`FileStore`](crate::slot::FileStore).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketKey(Arc<str>);

impl BucketKey {
    /// Derives the key for the given request URI.
    pub fn for_uri(uri: &str) -> Self {
        let digest = Sha256::digest(uri.as_bytes());
        let hex: String = digest.iter().map(|byte| format!("{byte:02x}")).collect();
        Self(hex.into())
    }

    /// The hex string of this key.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BucketKey({})", &self.0)
    }
}

/// A single request for a resource.
///
/// Every request carries a unique id, which makes it possible to tell concurrent requests for
/// the same key apart in logs and events. Cloning is cheap.
#[derive(Clone, Debug)]
pub struct Request {
    id: Uuid,
    uri: Arc<str>,
    key: BucketKey,
}

impl Request {
    /// Creates a request for the given URI.
    ///
    /// The URI is used as given, it is up to the caller to normalize it.
    pub fn new(uri: impl Into<String>) -> Self {
        let uri: String = uri.into();
        let key = BucketKey::for_uri(&uri);
        Self {
            id: Uuid::new_v4(),
            uri: uri.into(),
            key,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn key(&self) -> &BucketKey {
        &self.key
    }
}
