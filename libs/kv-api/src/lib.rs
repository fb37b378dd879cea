pub mod error;
pub mod pattern;
pub mod store;
pub mod value;

pub use error::{ErrorKind, StoreError};
pub use pattern::glob_match;
pub use store::{HashStore, StoreFuture};
pub use value::{ConnectionParams, FieldMap, FieldValue, RecordKey, ScanPage};
