//! Transport core for a Hotline protocol client.
//!
//! This crate is the hard part of a Hotline client: the buffered async
//! socket the control and transfer channels are built on, the transfer
//! handshake, the file/fork wire codec, and the four transfer clients
//! (download, upload, folder upload, preview) that move bytes over the
//! transfer subchannel at `serverPort + 1`.
//!
//! The generic Hotline transaction protocol (login, chat, file listing,
//! news, user administration) that rides the control channel is not part of
//! this crate; callers negotiate a `referenceNumber` and `transferSize`
//! through that external protocol and hand them to [`transfer::TransferContext`].
//!
//! This crate never installs a global `tracing` subscriber; embedding
//! applications do that themselves, e.g.:
//!
//! ```no_run
//! tracing_subscriber::fmt::init();
//! ```

pub mod error;
pub mod fork;
pub mod progress;
pub mod rate;
pub mod socket;
pub mod transfer;

pub use error::{HotlineError, Result};
pub use progress::{ErrorKind, ProgressSink, TransferEvent, TransferSample};
pub use rate::{Progress, RateEstimator};
pub use socket::{Endian, Socket, SocketConfig};
pub use transfer::{Destination, DownloadClient, FolderUploadClient, PreviewClient, TransferContext, UploadClient};
