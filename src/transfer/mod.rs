//! Transfer-subchannel clients (C4-C7): download, upload, folder upload, and
//! preview, all built on [`crate::socket::Socket`] and [`crate::fork`].

pub mod context;
pub mod download;
pub mod folder;
pub mod preview;
pub mod upload;

pub use context::TransferContext;
pub use download::{Destination, DownloadClient};
pub use folder::FolderUploadClient;
pub use preview::PreviewClient;
pub use upload::UploadClient;
