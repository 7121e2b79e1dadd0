pub mod manager;
pub mod remote;

pub use manager::{verify_key_version, Invalidation, KeyBootstrap, KeyManager, KeyRotation};
pub use remote::{IssuedKek, KeyIssuer};
