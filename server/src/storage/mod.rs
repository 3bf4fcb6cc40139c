pub mod blob;

pub use blob::{BlobError, BlobStore};
