//! File Download Client (C4).
//!
//! Opens the transfer handshake, reads the `FILP`/fork-header sequence, and
//! materializes the destination file one fork at a time, reporting a
//! `Transfer` event per chunk of the `DATA` fork.

use std::path::{Path, PathBuf};

use filetime::FileTime;
use futures_util::StreamExt;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::error::{HotlineError, Result};
use crate::fork::{self, FORK_TYPE_DATA, FORK_TYPE_INFO, FORK_TYPE_MACR};
use crate::progress::{self, ErrorKind, ProgressSink, TransferEvent, TransferSample};
use crate::rate::{Progress, RateEstimator};
use crate::socket::{Endian, Socket, SocketConfig};
use crate::transfer::context::TransferContext;

/// Where a downloaded file should land.
pub enum Destination {
    /// An exact final path; used as-is (no collision handling).
    Path(PathBuf),
    /// A directory; `download()` appends the requested filename, appending
    /// ` 2`, ` 3`, ... before the extension if that name already exists.
    Folder(PathBuf),
}

fn unique_path_in_folder(folder: &Path, filename: &str) -> PathBuf {
    let candidate = folder.join(filename);
    if !candidate.exists() {
        return candidate;
    }
    let stem = Path::new(filename).file_stem().and_then(|s| s.to_str()).unwrap_or(filename);
    let ext = Path::new(filename).extension().and_then(|s| s.to_str());
    for n in 2.. {
        let name = match ext {
            Some(ext) => format!("{stem} {n}.{ext}"),
            None => format!("{stem} {n}"),
        };
        let candidate = folder.join(&name);
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!("collision search is unbounded")
}

/// Downloads a single file from a Hotline transfer subchannel.
pub struct DownloadClient {
    context: TransferContext,
    config: SocketConfig,
    cancel: CancellationToken,
}

impl DownloadClient {
    pub fn new(context: TransferContext) -> Self {
        Self {
            context,
            config: SocketConfig::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_config(mut self, config: SocketConfig) -> Self {
        self.config = config;
        self
    }

    /// Cancels an in-flight `download()`. Idempotent; has no effect if the
    /// transfer already finished.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    async fn guard<T>(&self, fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(HotlineError::Cancelled),
            result = fut => result,
        }
    }

    pub async fn download(
        &self,
        filename: &str,
        destination: Destination,
        mut progress: Option<ProgressSink>,
    ) -> Result<PathBuf> {
        progress::emit(&mut progress, TransferEvent::Preparing);

        let final_path = match destination {
            Destination::Path(path) => path,
            Destination::Folder(folder) => unique_path_in_folder(&folder, filename),
        };
        let partial_path = partial_sibling(&final_path);

        let result = self.run(filename, &partial_path, &mut progress).await;

        match result {
            Ok(()) => {
                tokio::fs::rename(&partial_path, &final_path).await?;
                let partial_sidecar = fork::sidecar_path(&partial_path);
                if tokio::fs::metadata(&partial_sidecar).await.is_ok() {
                    tokio::fs::rename(&partial_sidecar, fork::sidecar_path(&final_path)).await?;
                }
                let url = final_path.to_string_lossy().into_owned();
                progress::emit(&mut progress, TransferEvent::Completed(Some(url)));
                tracing::info!(target: "transfer::download", path = %final_path.display(), "download complete");
                Ok(final_path)
            }
            Err(err) => {
                let _ = tokio::fs::remove_file(&partial_path).await;
                let _ = tokio::fs::remove_file(fork::sidecar_path(&partial_path)).await;
                tracing::error!(target: "transfer::download", error = %err, "download failed");
                progress::emit(&mut progress, TransferEvent::Error(ErrorKind::from(&err)));
                Err(err)
            }
        }
    }

    async fn run(&self, filename: &str, partial_path: &Path, progress: &mut Option<ProgressSink>) -> Result<()> {
        tracing::info!(target: "transfer::download", host = %self.context.server_host, port = self.context.transfer_port(), "connecting");
        progress::emit(progress, TransferEvent::Connecting);
        let socket = self
            .guard(Socket::connect(&self.context.server_host, self.context.transfer_port(), self.config))
            .await?;

        self.guard(async {
            socket.write(b"HTXF").await?;
            socket.write_u32(self.context.reference_number, Endian::Big).await?;
            socket.write_u32(0, Endian::Big).await?;
            socket.write_u32(0, Endian::Big).await
        })
        .await?;

        let header_bytes = self.guard(socket.read(24)).await?;
        let file_header = fork::decode_file_header(&header_bytes)?;
        progress::emit(progress, TransferEvent::Connected);

        let mut resource_fork_bytes: Option<Vec<u8>> = None;
        let mut dest_file: Option<File> = None;
        let mut dest_modified: Option<std::time::SystemTime> = None;
        let mut total_sent: u64 = 0;
        let total = self.context.transfer_size;
        let mut rate = RateEstimator::new(total);
        // Bytes already pulled off the wire that belong to the *next* fork
        // header rather than the fork just decoded (see the info-fork
        // corruption guard below). Prepended to the next header read instead
        // of being re-read from the socket.
        let mut next_header_prefix: Vec<u8> = Vec::new();

        for fork_index in 0..file_header.fork_count {
            let mut header_bytes = std::mem::take(&mut next_header_prefix);
            if header_bytes.len() > 16 {
                return Err(HotlineError::FailedToTransfer(
                    "info fork dataSize overran more than one fork header".to_string(),
                ));
            }
            let remaining = 16 - header_bytes.len();
            if remaining > 0 {
                header_bytes.extend(self.guard(socket.read(remaining)).await?);
            }
            let fork_header = fork::decode_fork_header(&header_bytes)?;
            tracing::debug!(target: "transfer::download", fork_index, fork_type = fork_header.fork_type, size = fork_header.data_size, "fork header");

            match fork_header.fork_type {
                FORK_TYPE_INFO => {
                    let bytes = self.guard(socket.read(fork_header.data_size as usize)).await?;
                    let (info, header_size) = fork::decode_info_fork(&bytes)?;
                    if header_size < bytes.len() {
                        tracing::debug!(
                            target: "transfer::download",
                            extra = bytes.len() - header_size,
                            "info fork dataSize over-reported by the server; realigning to the next fork header"
                        );
                        next_header_prefix = bytes[header_size..].to_vec();
                    }
                    let file = File::create(partial_path).await?;
                    dest_file = Some(file);
                    dest_modified = Some(info.modified);
                    tracing::debug!(target: "transfer::download", name = %info.name, "info fork applied");

                    total_sent += fork_header.data_size as u64;
                    progress::emit(
                        progress,
                        TransferEvent::Transfer(TransferSample {
                            name: filename.to_string(),
                            size: fork_header.data_size as u64,
                            progress: Progress { sent: total_sent, total, bytes_per_second: None, eta: None },
                        }),
                    );
                }
                FORK_TYPE_DATA => {
                    let file = dest_file.as_mut().ok_or_else(|| {
                        HotlineError::FailedToTransfer("DATA fork arrived before INFO fork".to_string())
                    })?;
                    let base_sent = total_sent;
                    let mut stream =
                        socket.receive_file(&mut *file, fork_header.data_size as u64, self.config.receive_chunk);
                    while let Some(chunk) = self.guard(async { Ok(stream.next().await) }).await? {
                        let chunk = chunk?;
                        let sample = rate.update(base_sent + chunk.sent);
                        progress::emit(
                            progress,
                            TransferEvent::Transfer(TransferSample {
                                name: filename.to_string(),
                                size: fork_header.data_size as u64,
                                progress: sample,
                            }),
                        );
                    }
                    total_sent = base_sent + fork_header.data_size as u64;
                }
                FORK_TYPE_MACR => {
                    let bytes = self.guard(socket.read(fork_header.data_size as usize)).await?;
                    resource_fork_bytes = Some(bytes);

                    total_sent += fork_header.data_size as u64;
                    progress::emit(
                        progress,
                        TransferEvent::Transfer(TransferSample {
                            name: filename.to_string(),
                            size: fork_header.data_size as u64,
                            progress: Progress { sent: total_sent, total, bytes_per_second: None, eta: None },
                        }),
                    );
                }
                _ => {
                    self.guard(socket.skip(fork_header.data_size as usize)).await?;
                    total_sent += fork_header.data_size as u64;
                    let sample = rate.update(total_sent);
                    progress::emit(
                        progress,
                        TransferEvent::Transfer(TransferSample {
                            name: filename.to_string(),
                            size: fork_header.data_size as u64,
                            progress: sample,
                        }),
                    );
                }
            }
        }

        if let Some(mut file) = dest_file.take() {
            file.flush().await?;
        } else {
            // forkCount = 0 is legal: create an empty destination file.
            File::create(partial_path).await?;
        }

        if let Some(modified) = dest_modified {
            let path = partial_path.to_path_buf();
            let mtime = FileTime::from_system_time(modified);
            tokio::task::spawn_blocking(move || filetime::set_file_mtime(&path, mtime))
                .await
                .map_err(|e| HotlineError::Io(std::io::Error::other(e)))??;
        }

        if let Some(bytes) = resource_fork_bytes {
            let sidecar = fork::sidecar_path(partial_path);
            tracing::warn!(target: "transfer::download", sidecar = %sidecar.display(), "resource fork spooled to sidecar file");
            let mut sidecar_file = File::create(&sidecar).await?;
            sidecar_file.write_all(&bytes).await?;
            sidecar_file.flush().await?;
        }

        Ok(())
    }
}

fn partial_sibling(path: &Path) -> PathBuf {
    let mut os_string = path.as_os_str().to_owned();
    os_string.push(".part");
    PathBuf::from(os_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fork::{encode_file_header, encode_fork_header, encode_info_fork, InfoFork, FORK_TYPE_DATA, FORK_TYPE_INFO};
    use tempfile::tempdir;
    use tokio::io::AsyncWriteExt as _;
    use tokio::net::{TcpListener, TcpStream};

    #[tokio::test]
    async fn downloads_one_info_and_data_fork() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut handshake = [0u8; 16];
            tokio::io::AsyncReadExt::read_exact(&mut stream, &mut handshake).await.unwrap();
            assert_eq!(&handshake[0..4], b"HTXF");

            stream.write_all(&encode_file_header(2)).await.unwrap();

            let info = InfoFork {
                name: "t.bin".to_string(),
                ..Default::default()
            };
            let info_bytes = encode_info_fork(&info);
            stream.write_all(&encode_fork_header(FORK_TYPE_INFO, info_bytes.len() as u32)).await.unwrap();
            stream.write_all(&info_bytes).await.unwrap();

            stream.write_all(&encode_fork_header(FORK_TYPE_DATA, 4)).await.unwrap();
            stream.write_all(&[0xDE, 0xAD, 0xBE, 0xEF]).await.unwrap();
        });

        let dir = tempdir().unwrap();
        let context = TransferContext::new(addr.ip().to_string(), addr.port() - 1, 0x0001_0001, 4);
        let client = DownloadClient::new(context);
        let path = client
            .download("t.bin", Destination::Folder(dir.path().to_path_buf()), None)
            .await
            .unwrap();

        let bytes = tokio::fs::read(&path).await.unwrap();
        assert_eq!(bytes, vec![0xDE, 0xAD, 0xBE, 0xEF]);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn realigns_when_server_over_reports_info_fork_size() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut handshake = [0u8; 16];
            tokio::io::AsyncReadExt::read_exact(&mut stream, &mut handshake).await.unwrap();

            stream.write_all(&encode_file_header(2)).await.unwrap();

            let info = InfoFork {
                name: "t.bin".to_string(),
                ..Default::default()
            };
            let info_bytes = encode_info_fork(&info);
            // Simulate the known server bug: the INFO fork header's declared
            // dataSize is 2 bytes too large, so it counts the first two bytes
            // of the next (DATA) fork header's type code (`"DA"`, 0x4441) as
            // if they belonged to the info payload. No comment was sent.
            stream
                .write_all(&encode_fork_header(FORK_TYPE_INFO, info_bytes.len() as u32 + 2))
                .await
                .unwrap();
            stream.write_all(&info_bytes).await.unwrap();

            stream.write_all(&encode_fork_header(FORK_TYPE_DATA, 3)).await.unwrap();
            stream.write_all(&[1, 2, 3]).await.unwrap();
        });

        let dir = tempdir().unwrap();
        let context = TransferContext::new(addr.ip().to_string(), addr.port() - 1, 0, 3);
        let client = DownloadClient::new(context);
        let path = client
            .download("t.bin", Destination::Folder(dir.path().to_path_buf()), None)
            .await
            .unwrap();

        let bytes = tokio::fs::read(&path).await.unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
        server.await.unwrap();
    }

    #[test]
    fn unique_path_appends_counter_before_extension() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"x").unwrap();
        let path = unique_path_in_folder(dir.path(), "a.txt");
        assert_eq!(path.file_name().unwrap().to_str().unwrap(), "a 2.txt");
    }
}
