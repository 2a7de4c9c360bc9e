//! Folder Upload Client (C6).
//!
//! Walks a directory tree, then drives a small state machine against
//! server-sent folder action codes, one file at a time, reusing
//! [`crate::transfer::upload::UploadClient::send_forks`] for each file's
//! fork sequence.

use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::error::{HotlineError, Result};
use crate::fork;
use crate::progress::{self, ErrorKind, ProgressSink, TransferEvent, TransferSample};
use crate::rate::RateEstimator;
use crate::socket::{Endian, Socket, SocketConfig};
use crate::transfer::context::TransferContext;
use crate::transfer::upload::UploadClient;

const ACTION_SEND_FILE: u16 = 1;
const ACTION_RESUME_FILE: u16 = 2;
const ACTION_NEXT_FILE: u16 = 3;

/// One entry of the pre-scanned folder tree.
#[derive(Debug, Clone)]
struct FolderItem {
    is_folder: bool,
    /// Path components relative to (and excluding) the root directory name.
    components: Vec<String>,
    absolute_path: PathBuf,
    size: u64,
}

impl FolderItem {
    fn name(&self) -> &str {
        self.components.last().map(String::as_str).unwrap_or("")
    }

    fn encode_header(&self) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&(if self.is_folder { 1u16 } else { 0u16 }).to_be_bytes());
        body.extend_from_slice(&(self.components.len() as u16).to_be_bytes());
        for component in &self.components {
            let bytes = component.as_bytes();
            body.extend_from_slice(&0u16.to_be_bytes());
            body.push(bytes.len() as u8);
            body.extend_from_slice(bytes);
        }
        let header_size = (2 + body.len()) as u16;
        let mut out = Vec::with_capacity(2 + body.len());
        out.extend_from_slice(&header_size.to_be_bytes());
        out.extend_from_slice(&body);
        out
    }
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.'))
        .unwrap_or(false)
}

fn scan(root: &Path) -> Result<(Vec<FolderItem>, u64)> {
    // The wire format never repeats the root directory name, but a usable
    // name is still required of it.
    root.file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| HotlineError::FailedToTransfer("folder has no usable name".to_string()))?;

    let mut items = Vec::new();
    let mut total = 0u64;

    let mut walker = WalkDir::new(root).min_depth(1).sort_by_file_name().into_iter();
    while let Some(entry) = walker.next() {
        let entry = entry.map_err(|e| HotlineError::FailedToTransfer(format!("folder walk failed: {e}")))?;
        if is_hidden(entry.path()) {
            if entry.file_type().is_dir() {
                walker.skip_current_dir();
            }
            continue;
        }

        let relative = entry.path().strip_prefix(root).expect("walkdir yields children of root");
        let components: Vec<String> =
            relative.components().map(|c| c.as_os_str().to_string_lossy().into_owned()).collect();

        let metadata = entry.metadata().map_err(|e| HotlineError::FailedToTransfer(format!("stat failed: {e}")))?;
        let is_folder = metadata.is_dir();
        let size = if is_folder { 0 } else { metadata.len() };
        if !is_folder {
            total += size;
        }

        items.push(FolderItem {
            is_folder,
            components,
            absolute_path: entry.path().to_path_buf(),
            size,
        });
    }

    Ok((items, total))
}

enum State {
    WaitingForNextFile,
    SendingItemHeader(usize),
    WaitingForFileAction(usize),
    UploadingFile(usize),
    Done,
}

/// Uploads an entire directory tree, driving a state machine against
/// server-sent folder action codes.
pub struct FolderUploadClient {
    context: TransferContext,
    config: SocketConfig,
    cancel: CancellationToken,
}

impl FolderUploadClient {
    pub fn new(context: TransferContext) -> Self {
        Self {
            context,
            config: SocketConfig::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    async fn guard<T>(&self, fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(HotlineError::Cancelled),
            result = fut => result,
        }
    }

    pub async fn upload(
        &self,
        root: &Path,
        mut progress: Option<ProgressSink>,
        mut item_progress: Option<Box<dyn FnMut(&str, usize, usize) + Send>>,
    ) -> Result<()> {
        progress::emit(&mut progress, TransferEvent::Preparing);

        if !tokio::fs::metadata(root).await.map(|m| m.is_dir()).unwrap_or(false) {
            let err = HotlineError::FailedToTransfer(format!("{} is not a directory", root.display()));
            progress::emit(&mut progress, TransferEvent::Error(ErrorKind::from(&err)));
            return Err(err);
        }

        let (items, transfer_total) = scan(root)?;
        let total_items = items.len();

        if items.is_empty() {
            progress::emit(&mut progress, TransferEvent::Completed(None));
            return Ok(());
        }

        let result = self
            .run(&items, total_items, transfer_total, &mut progress, &mut item_progress)
            .await;

        match &result {
            Ok(()) => {
                tracing::info!(target: "transfer::folder", root = %root.display(), "folder upload complete");
                progress::emit(&mut progress, TransferEvent::Completed(None));
            }
            Err(err) => {
                tracing::error!(target: "transfer::folder", error = %err, "folder upload failed");
                progress::emit(&mut progress, TransferEvent::Error(ErrorKind::from(err)));
            }
        }
        result
    }

    async fn run(
        &self,
        items: &[FolderItem],
        total_items: usize,
        transfer_total: u64,
        progress: &mut Option<ProgressSink>,
        item_progress: &mut Option<Box<dyn FnMut(&str, usize, usize) + Send>>,
    ) -> Result<()> {
        tracing::info!(target: "transfer::folder", host = %self.context.server_host, port = self.context.transfer_port(), "connecting");
        progress::emit(progress, TransferEvent::Connecting);
        let socket = self
            .guard(Socket::connect(&self.context.server_host, self.context.transfer_port(), self.config))
            .await?;

        self.guard(async {
            socket.write(b"HTXF").await?;
            socket.write_u32(self.context.reference_number, Endian::Big).await?;
            socket.write_u32(0, Endian::Big).await?;
            // Folder flag: u16 type=1, u16 reserved=0, packed into one u32 word.
            socket.write_u32(0x0001_0000, Endian::Big).await
        })
        .await?;
        progress::emit(progress, TransferEvent::Connected);

        let upload_client = UploadClient::new(self.context.clone());
        let mut rate = RateEstimator::new(transfer_total);
        let mut sent_so_far = 0u64;
        let mut next_index = 0usize;
        let mut state = State::WaitingForNextFile;

        loop {
            state = match state {
                State::WaitingForNextFile => {
                    let action = self.guard(socket.read_u16(Endian::Big)).await?;
                    if action != ACTION_NEXT_FILE {
                        return Err(HotlineError::FailedToTransfer(format!("unexpected folder action {action}")));
                    }
                    if next_index < items.len() {
                        let index = next_index;
                        next_index += 1;
                        State::SendingItemHeader(index)
                    } else {
                        State::Done
                    }
                }
                State::SendingItemHeader(index) => {
                    let item = &items[index];
                    self.guard(async { socket.write(&item.encode_header()).await }).await?;
                    if item.is_folder {
                        State::WaitingForNextFile
                    } else {
                        State::WaitingForFileAction(index)
                    }
                }
                State::WaitingForFileAction(index) => {
                    let action = self.guard(socket.read_u16(Endian::Big)).await?;
                    match action {
                        ACTION_SEND_FILE => State::UploadingFile(index),
                        ACTION_NEXT_FILE => {
                            if next_index < items.len() {
                                let next = next_index;
                                next_index += 1;
                                State::SendingItemHeader(next)
                            } else {
                                State::Done
                            }
                        }
                        ACTION_RESUME_FILE => {
                            let len = self.guard(socket.read_u16(Endian::Big)).await?;
                            self.guard(socket.skip(len as usize)).await?;
                            State::UploadingFile(index)
                        }
                        other => {
                            return Err(HotlineError::FailedToTransfer(format!("unexpected file action {other}")));
                        }
                    }
                }
                State::UploadingFile(index) => {
                    let item = &items[index];
                    if let Some(cb) = item_progress.as_mut() {
                        cb(item.name(), index + 1, total_items);
                    }

                    let metadata = tokio::fs::metadata(&item.absolute_path).await?;
                    let info = fork::info_fork_from_metadata(item.name(), &metadata);
                    let info_bytes = fork::encode_info_fork(&info);
                    let sizes = fork::read_fork_sizes(&item.absolute_path)?;

                    self.guard(async { socket.write_u32(item.size as u32, Endian::Big).await }).await?;

                    let base_sent = sent_so_far;
                    let name = item.name().to_string();
                    let item_size = item.size;

                    self.guard(upload_client.send_forks(
                        &socket,
                        item.name(),
                        &info_bytes,
                        &sizes,
                        &item.absolute_path,
                        item.size,
                        &mut |event| {
                            if let TransferEvent::Transfer(sample) = event {
                                let folded = rate.update(base_sent + sample.progress.sent);
                                progress::emit(
                                    progress,
                                    TransferEvent::Transfer(TransferSample {
                                        name: name.clone(),
                                        size: item_size,
                                        progress: folded,
                                    }),
                                );
                            }
                        },
                    ))
                    .await?;

                    sent_so_far = base_sent + item_size;

                    State::WaitingForNextFile
                }
                State::Done => break,
            };
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn uploads_empty_directory_without_opening_a_socket() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("empty");
        tokio::fs::create_dir(&root).await.unwrap();

        let context = TransferContext::new("127.0.0.1", 1, 0, 0);
        let client = FolderUploadClient::new(context);
        client.upload(&root, None, None).await.unwrap();
    }

    #[tokio::test]
    async fn scans_nested_files_before_connecting() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("A");
        tokio::fs::create_dir_all(root.join("sub")).await.unwrap();
        tokio::fs::write(root.join("file1"), b"ab").await.unwrap();
        tokio::fs::write(root.join("sub/file2"), b"abc").await.unwrap();

        let (items, total) = scan(&root).unwrap();
        assert_eq!(total, 5);
        assert_eq!(items.len(), 3);
    }

    #[tokio::test]
    async fn server_skipping_a_file_advances_past_it() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("A");
        tokio::fs::create_dir(&root).await.unwrap();
        tokio::fs::write(root.join("file1"), b"ab").await.unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut handshake = [0u8; 16];
            stream.read_exact(&mut handshake).await.unwrap();

            stream.write_all(&ACTION_NEXT_FILE.to_be_bytes()).await.unwrap();
            let mut header_size = [0u8; 2];
            stream.read_exact(&mut header_size).await.unwrap();
            let size = u16::from_be_bytes(header_size) as usize - 2;
            let mut rest = vec![0u8; size];
            stream.read_exact(&mut rest).await.unwrap();

            // Skip the file instead of accepting it.
            stream.write_all(&ACTION_NEXT_FILE.to_be_bytes()).await.unwrap();
        });

        let context = TransferContext::new(addr.ip().to_string(), addr.port() - 1, 0, 0);
        let client = FolderUploadClient::new(context);
        client.upload(&root, None, None).await.unwrap();
        server.await.unwrap();
    }
}
