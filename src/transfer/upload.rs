//! File Upload Client (C5).
//!
//! The inverse of the download client's wire layout: opens the handshake,
//! emits the `FILP`/fork-header sequence, and streams each fork's bytes
//! using [`crate::fork`]'s encoders.

use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use tokio::fs::File;
use tokio_util::sync::CancellationToken;

use crate::error::{HotlineError, Result};
use crate::fork::{self, ForkSizes, InfoFork, FORK_TYPE_DATA, FORK_TYPE_INFO, FORK_TYPE_MACR};
use crate::progress::{self, ErrorKind, ProgressSink, TransferEvent, TransferSample};
use crate::rate::RateEstimator;
use crate::socket::{Endian, Socket, SocketConfig};
use crate::transfer::context::TransferContext;

/// Default chunk size for streamed writes.
pub const DEFAULT_UPLOAD_CHUNK: usize = 256 * 1024;

/// Uploads a single regular file to a Hotline transfer subchannel.
pub struct UploadClient {
    context: TransferContext,
    config: SocketConfig,
    chunk_size: usize,
    cancel: CancellationToken,
}

impl UploadClient {
    pub fn new(context: TransferContext) -> Self {
        Self {
            context,
            config: SocketConfig::default(),
            chunk_size: DEFAULT_UPLOAD_CHUNK,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_config(mut self, config: SocketConfig) -> Self {
        self.config = config;
        self
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

    pub async fn upload(&self, file_url: &Path, mut progress: Option<ProgressSink>) -> Result<()> {
        progress::emit(&mut progress, TransferEvent::Preparing);
        let result = self.run(file_url, &mut progress).await;
        match &result {
            Ok(()) => {
                tracing::info!(target: "transfer::upload", path = %file_url.display(), "upload complete");
                progress::emit(&mut progress, TransferEvent::Completed(None));
            }
            Err(err) => {
                tracing::error!(target: "transfer::upload", error = %err, "upload failed");
                progress::emit(&mut progress, TransferEvent::Error(ErrorKind::from(err)));
            }
        }
        result
    }

    async fn run(&self, file_url: &Path, progress: &mut Option<ProgressSink>) -> Result<()> {
        let metadata = tokio::fs::metadata(file_url).await?;
        if !metadata.is_file() {
            return Err(HotlineError::FailedToTransfer(format!(
                "{} is not a regular file",
                file_url.display()
            )));
        }
        let name = file_url
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| HotlineError::FailedToTransfer("file has no usable name".to_string()))?
            .to_string();

        let info = fork::info_fork_from_metadata(&name, &metadata);
        let info_bytes = fork::encode_info_fork(&info);
        let sizes = fork::read_fork_sizes(file_url)?;
        let flattened = fork::flattened_size(file_url, info_bytes.len() as u64)?;

        tracing::info!(target: "transfer::upload", host = %self.context.server_host, port = self.context.transfer_port(), "connecting");
        progress::emit(progress, TransferEvent::Connecting);
        let socket = self
            .guard(Socket::connect(&self.context.server_host, self.context.transfer_port(), self.config))
            .await?;

        self.guard(async {
            socket.write(b"HTXF").await?;
            socket.write_u32(self.context.reference_number, Endian::Big).await?;
            socket.write_u32(flattened as u32, Endian::Big).await?;
            socket.write_u32(0, Endian::Big).await
        })
        .await?;
        progress::emit(progress, TransferEvent::Connected);

        self.send_forks(&socket, &name, &info_bytes, &sizes, file_url, flattened, &mut |event| {
            progress::emit(progress, event);
        })
        .await
    }

    /// Sends the INFO, DATA, and optional MACR forks for one file, preceded
    /// by the caller-supplied `FileHeader`. Reused verbatim by the folder
    /// upload state machine's UPLOADING_FILE state, which passes a closure
    /// that folds each sample into the folder-level rate estimate instead of
    /// emitting it directly.
    pub(crate) async fn send_forks(
        &self,
        socket: &Socket,
        name: &str,
        info_bytes: &[u8],
        sizes: &ForkSizes,
        file_url: &Path,
        total: u64,
        on_event: &mut dyn FnMut(TransferEvent),
    ) -> Result<()> {
        let fork_count: u16 = if sizes.resource_fork_size > 0 { 3 } else { 2 };
        self.guard(async { socket.write(&fork::encode_file_header(fork_count)).await }).await?;

        self.guard(async {
            socket.write(&fork::encode_fork_header(FORK_TYPE_INFO, info_bytes.len() as u32)).await?;
            socket.write(info_bytes).await
        })
        .await?;

        let mut rate = RateEstimator::new(total);
        let mut sent_before = info_bytes.len() as u64 + header_overhead(fork_count);

        if sizes.data_fork_size > 0 {
            self.guard(async {
                socket
                    .write(&fork::encode_fork_header(FORK_TYPE_DATA, sizes.data_fork_size as u32))
                    .await
            })
            .await?;
            let file = File::open(file_url).await?;
            let mut stream = socket.write_file(file, sizes.data_fork_size, self.chunk_size);
            while let Some(chunk) = self.guard(async { Ok(stream.next().await) }).await? {
                let chunk = chunk?;
                let sample = rate.update(sent_before + chunk.sent);
                on_event(TransferEvent::Transfer(TransferSample {
                    name: name.to_string(),
                    size: sizes.data_fork_size,
                    progress: sample,
                }));
            }
            sent_before += sizes.data_fork_size;
        }

        if sizes.resource_fork_size > 0 {
            self.guard(async {
                socket
                    .write(&fork::encode_fork_header(FORK_TYPE_MACR, sizes.resource_fork_size as u32))
                    .await
            })
            .await?;
            let sidecar = fork::sidecar_path(file_url);
            let file = File::open(&sidecar).await?;
            let mut stream = socket.write_file(file, sizes.resource_fork_size, self.chunk_size);
            while let Some(chunk) = self.guard(async { Ok(stream.next().await) }).await? {
                let chunk = chunk?;
                let sample = rate.update(sent_before + chunk.sent);
                on_event(TransferEvent::Transfer(TransferSample {
                    name: name.to_string(),
                    size: sizes.resource_fork_size,
                    progress: sample,
                }));
            }
        }

        Ok(())
    }
}

fn header_overhead(fork_count: u16) -> u64 {
    (4 + 2 + 16 + 2) as u64 + (fork_count as u64) * 16
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn uploads_a_small_file() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("hello.txt");
        tokio::fs::write(&file_path, b"hello world").await.unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut handshake = [0u8; 16];
            stream.read_exact(&mut handshake).await.unwrap();
            assert_eq!(&handshake[0..4], b"HTXF");

            let mut file_header = [0u8; 24];
            stream.read_exact(&mut file_header).await.unwrap();
            assert_eq!(&file_header[0..4], b"FILP");
            let fork_count = u16::from_be_bytes([file_header[22], file_header[23]]);
            assert_eq!(fork_count, 2);

            let mut info_header = [0u8; 16];
            stream.read_exact(&mut info_header).await.unwrap();
            let info_size = u32::from_be_bytes([info_header[12], info_header[13], info_header[14], info_header[15]]);
            let mut info_bytes = vec![0u8; info_size as usize];
            stream.read_exact(&mut info_bytes).await.unwrap();

            let mut data_header = [0u8; 16];
            stream.read_exact(&mut data_header).await.unwrap();
            let data_size = u32::from_be_bytes([data_header[12], data_header[13], data_header[14], data_header[15]]);
            let mut data_bytes = vec![0u8; data_size as usize];
            stream.read_exact(&mut data_bytes).await.unwrap();
            data_bytes
        });

        let context = TransferContext::new(addr.ip().to_string(), addr.port() - 1, 7, 0);
        let client = UploadClient::new(context);
        client.upload(&file_path, None).await.unwrap();

        let received = server.await.unwrap();
        assert_eq!(received, b"hello world");
    }
}
