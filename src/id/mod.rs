pub mod cache;
pub mod codec;

pub use cache::{BidiCache, CacheStats};
pub use codec::{DecodedId, ID_LENGTH, IdCodec, IdRequest};
