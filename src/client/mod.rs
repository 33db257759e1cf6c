//! Upload client: validates a file, then sends it either in one request or
//! as a sequence of fixed-size chunks followed by a completion call.

pub mod error;
pub mod session;
pub mod source;
pub mod transport;
pub mod uploader;
pub mod validation;

pub use error::{RequestKind, UploadError};
pub use session::{ProgressEvent, ProgressSender, UploadPhase, UploadSession};
pub use source::UploadFile;
pub use transport::{ChunkRequest, HttpTransport, UploadTransport};
pub use uploader::UploadClient;
pub use validation::{requires_chunking, validate};
