//! File Preview Client (C7).
//!
//! A thin specialization of the download handshake without fork decoding:
//! the payload is streamed straight to a temporary file since preview bytes
//! are opaque.

use std::path::PathBuf;

use futures_util::StreamExt;
use tokio::fs::File;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{HotlineError, Result};
use crate::progress::{self, ErrorKind, ProgressSink, TransferEvent, TransferSample};
use crate::rate::RateEstimator;
use crate::socket::{Endian, Socket, SocketConfig};
use crate::transfer::context::TransferContext;

/// Streams a preview payload to a temporary file and tracks it for cleanup.
pub struct PreviewClient {
    context: TransferContext,
    config: SocketConfig,
    filename: String,
    cancel: CancellationToken,
    temp_path: std::sync::Mutex<Option<PathBuf>>,
}

impl PreviewClient {
    pub fn new(context: TransferContext, filename: impl Into<String>) -> Self {
        Self {
            context,
            config: SocketConfig::default(),
            filename: filename.into(),
            cancel: CancellationToken::new(),
            temp_path: std::sync::Mutex::new(None),
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

    pub async fn preview(&self, mut progress: Option<ProgressSink>) -> Result<PathBuf> {
        progress::emit(&mut progress, TransferEvent::Preparing);
        let result = self.run(&mut progress).await;
        match &result {
            Ok(path) => {
                tracing::info!(target: "transfer::preview", path = %path.display(), "preview complete");
                progress::emit(&mut progress, TransferEvent::Completed(Some(path.to_string_lossy().into_owned())));
            }
            Err(err) => {
                tracing::error!(target: "transfer::preview", error = %err, "preview failed");
                progress::emit(&mut progress, TransferEvent::Error(ErrorKind::from(err)));
            }
        }
        result
    }

    async fn run(&self, progress: &mut Option<ProgressSink>) -> Result<PathBuf> {
        tracing::info!(target: "transfer::preview", host = %self.context.server_host, port = self.context.transfer_port(), "connecting");
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
        progress::emit(progress, TransferEvent::Connected);

        let temp_path = std::env::temp_dir().join(format!("{}_{}", Uuid::new_v4(), self.filename));
        *self.temp_path.lock().expect("temp_path mutex poisoned") = Some(temp_path.clone());

        let file = File::create(&temp_path).await?;
        let total = self.context.transfer_size;
        let mut rate = RateEstimator::new(total);
        let mut stream = socket.receive_file(file, total, self.config.receive_chunk);
        while let Some(chunk) = self.guard(async { Ok(stream.next().await) }).await? {
            let chunk = chunk?;
            let sample = rate.update(chunk.sent);
            progress::emit(
                progress,
                TransferEvent::Transfer(TransferSample {
                    name: self.filename.clone(),
                    size: total,
                    progress: sample,
                }),
            );
        }

        Ok(temp_path)
    }

    /// Removes the temporary file created by a completed or in-flight
    /// `preview()` and clears the stored path. Safe to call multiple times.
    pub async fn cleanup(&self) {
        let path = self.temp_path.lock().expect("temp_path mutex poisoned").take();
        if let Some(path) = path {
            if let Err(error) = tokio::fs::remove_file(&path).await {
                tracing::warn!(target: "transfer::preview", path = %path.display(), %error, "cleanup failed to remove temp file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt as _;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn streams_opaque_bytes_to_a_temp_file() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let payload = vec![7u8; 4096];
        let payload_clone = payload.clone();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut handshake = [0u8; 16];
            tokio::io::AsyncReadExt::read_exact(&mut stream, &mut handshake).await.unwrap();
            stream.write_all(&payload_clone).await.unwrap();
        });

        let context = TransferContext::new(addr.ip().to_string(), addr.port() - 1, 0, payload.len() as u64);
        let client = PreviewClient::new(context, "preview.jpg");
        let path = client.preview(None).await.unwrap();

        let on_disk = tokio::fs::read(&path).await.unwrap();
        assert_eq!(on_disk, payload);

        client.cleanup().await;
        assert!(tokio::fs::metadata(&path).await.is_err());
        server.await.unwrap();
    }
}
