//! Contract for the remote key-issuance service.

use async_trait::async_trait;

use crate::error::RemoteError;

/// Master key as issued by the server.
#[derive(Clone)]
pub struct IssuedKek {
    /// Transport form of the master key (`MasterKey::export`).
    pub kek: Vec<u8>,
    pub kek_version: u32,
    /// The server asks the client to rotate at its next opportunity.
    pub needs_rotation: bool,
}

impl std::fmt::Debug for IssuedKek {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedKek")
            .field("kek", &"<redacted>")
            .field("kek_version", &self.kek_version)
            .field("needs_rotation", &self.needs_rotation)
            .finish()
    }
}

/// User-implemented client for the key-issuance endpoint of the signed-in
/// identity.
#[async_trait]
pub trait KeyIssuer: Send + Sync {
    /// Return the identity's current master key. When none exists yet the
    /// server atomically adopts `seed` as version 1; otherwise `seed` is
    /// ignored.
    async fn get_or_create_kek(&self, seed: Option<Vec<u8>>) -> Result<IssuedKek, RemoteError>;

    /// Replace the master key with `new_kek`. Returns the new version.
    async fn rotate_kek(&self, new_kek: Vec<u8>) -> Result<u32, RemoteError>;
}
