pub mod codec;
pub mod encrypted;
pub mod record;

pub use codec::{Payload, TypedArray};
pub use encrypted::{Cached, EncryptedStore};
pub use record::CacheRecord;
