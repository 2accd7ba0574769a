//! # Storage driver interface
//!
//! The capability set every storage backend implements ([`Driver`]), the
//! request [`Context`] passed to each operation, and the error taxonomy
//! shared by drivers and their callers.

mod context;
mod driver;
mod error;
pub mod path;

pub use context::Context;
pub use context::ContextCancelled;
pub use driver::unsupported;
pub use driver::walk_fallback;
pub use driver::Driver;
pub use driver::FileInfo;
pub use driver::FileWriter;
pub use driver::Reader;
pub use driver::UrlOptions;
pub use driver::WalkControl;
pub use driver::WalkFn;
pub use error::RequestCancelledError;
pub use error::StorageError;
pub use error::StorageErrorBuilder;
pub use error::StorageErrorKind;
pub use error::CLIENT_CLOSED_REQUEST;
