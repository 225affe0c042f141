use std::{path::Path, time::Instant};

use derive_more::Debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::AdbDevice;
use crate::{
    adb::connection::{Connection, SYNC_MAX_CHUNK, SyncId},
    error::{BridgeError, Result},
    models::TransferProgress,
    utils::{display_size, unix_mtime_now},
};

/// Permission bits of uploaded files.
pub const UPLOAD_MODE: u32 = 0o664;

type ProgressFn = Box<dyn FnMut(TransferProgress) + Send>;

/// Per-transfer settings.
#[derive(Debug, Default)]
pub struct TransferOptions {
    /// Upload chunk size. Defaults to the configured transfer chunk size; capped at 64 KiB.
    pub chunk_size: Option<usize>,
    #[debug(skip)]
    on_progress: Option<ProgressFn>,
}

impl TransferOptions {
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    /// Called after every chunk with the cumulative byte count.
    pub fn on_progress(mut self, f: impl FnMut(TransferProgress) + Send + 'static) -> Self {
        self.on_progress = Some(Box::new(f));
        self
    }

    fn report(&mut self, progress: TransferProgress) {
        if let Some(f) = self.on_progress.as_mut() {
            f(progress);
        }
    }
}

/// Reads until `buf` is full or the reader is exhausted.
async fn fill_chunk<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// First numeric token of `du -b` output.
fn parse_du_output(output: &str) -> Option<u64> {
    output.split_whitespace().next()?.parse().ok()
}

fn cancelled(conn: &mut Connection, done: u64, total: u64) -> BridgeError {
    info!(done = %display_size(done), total = %display_size(total), "Transfer cancelled");
    conn.close();
    BridgeError::Cancelled
}

impl AdbDevice {
    async fn open_sync(&self) -> Result<Connection> {
        let mut conn = self.connect().await?;
        conn.execute("sync:").await?;
        Ok(conn)
    }

    /// Size in bytes of a remote file, as reported by `du -b`.
    #[instrument(level = "debug", skip(self), fields(serial = %self.serial()), err)]
    pub async fn remote_size(&self, path: &str) -> Result<u64> {
        let output = self.run_command("du", &["-b", path]).await?;
        let output = String::from_utf8_lossy(&output);
        parse_du_output(&output).ok_or_else(|| BridgeError::parse("du output", output.trim()))
    }

    /// Writes `reader` to `dest_path` on the device.
    ///
    /// `cancel` is checked before each chunk is read; a cancelled upload leaves the partial
    /// remote file in place. A reader longer than `total_size` fails with
    /// [`BridgeError::InvalidArgument`] before the extra bytes are sent.
    #[instrument(
        level = "debug",
        skip(self, cancel, reader, options),
        fields(serial = %self.serial()),
        err
    )]
    pub async fn upload<R: AsyncRead + Unpin + Send>(
        &self,
        cancel: &CancellationToken,
        mut reader: R,
        total_size: u64,
        dest_path: &str,
        mut options: TransferOptions,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(BridgeError::Cancelled);
        }
        let chunk_size =
            options.chunk_size.unwrap_or(self.server().chunk_size).clamp(1, SYNC_MAX_CHUNK);
        let started = Instant::now();
        let mut conn = self.open_sync().await?;
        let request = format!("{dest_path},{UPLOAD_MODE}");
        conn.write_sync_packet(SyncId::Send, request.as_bytes()).await?;

        let mut buf = vec![0u8; chunk_size];
        let mut sent = 0u64;
        loop {
            if cancel.is_cancelled() {
                return Err(cancelled(&mut conn, sent, total_size));
            }
            let n = fill_chunk(&mut reader, &mut buf).await?;
            if n == 0 {
                break;
            }
            if sent + n as u64 > total_size {
                conn.close();
                return Err(BridgeError::InvalidArgument(format!(
                    "reader yielded more than the announced {total_size} bytes"
                )));
            }
            conn.write_sync_packet(SyncId::Data, &buf[..n]).await?;
            sent += n as u64;
            options.report(TransferProgress::new(sent, total_size));
        }

        conn.write_sync_header(SyncId::Done, unix_mtime_now()).await?;
        let (id, len) = conn.read_sync_header().await?;
        let result = match id {
            SyncId::Okay => Ok(()),
            SyncId::Fail => Err(conn.read_sync_failure(&format!("SEND {dest_path}"), len).await?),
            other => Err(BridgeError::protocol(format!("unexpected {other:?} after DONE"))),
        };
        conn.close();
        result?;

        if sent != total_size {
            warn!(sent, total_size, "Upload size differs from the announced total");
        }
        info!(
            dest = dest_path,
            size = %display_size(sent),
            elapsed = ?started.elapsed(),
            "Upload finished"
        );
        Ok(())
    }

    /// Streams `src_path` from the device into `writer`. Returns the number of bytes written.
    ///
    /// Same cancellation contract as [`AdbDevice::upload`], checked before each packet. Fails
    /// before opening the sync session if the remote size cannot be read.
    #[instrument(
        level = "debug",
        skip(self, cancel, writer, options),
        fields(serial = %self.serial()),
        err
    )]
    pub async fn download<W: AsyncWrite + Unpin + Send>(
        &self,
        cancel: &CancellationToken,
        src_path: &str,
        mut writer: W,
        mut options: TransferOptions,
    ) -> Result<u64> {
        if cancel.is_cancelled() {
            return Err(BridgeError::Cancelled);
        }
        let total = self.remote_size(src_path).await?;
        debug!(total = %display_size(total), "Downloading");
        let started = Instant::now();
        let mut conn = self.open_sync().await?;
        conn.write_sync_packet(SyncId::Recv, src_path.as_bytes()).await?;

        let mut buf = vec![0u8; SYNC_MAX_CHUNK];
        let mut received = 0u64;
        loop {
            if cancel.is_cancelled() {
                return Err(cancelled(&mut conn, received, total));
            }
            let (id, len) = conn.read_sync_header().await?;
            match id {
                SyncId::Data => {
                    let len = len as usize;
                    if len > SYNC_MAX_CHUNK {
                        conn.close();
                        let message = format!("oversized DATA packet ({len} bytes)");
                        return Err(BridgeError::protocol(message));
                    }
                    if received + len as u64 > total {
                        conn.close();
                        let message = format!("{src_path} grew past {total} bytes during RECV");
                        return Err(BridgeError::protocol(message));
                    }
                    conn.read_exact(&mut buf[..len]).await?;
                    writer.write_all(&buf[..len]).await?;
                    received += len as u64;
                    options.report(TransferProgress::new(received, total));
                }
                SyncId::Done => break,
                SyncId::Fail => {
                    let err = conn.read_sync_failure(&format!("RECV {src_path}"), len).await?;
                    conn.close();
                    return Err(err);
                }
                other => {
                    conn.close();
                    return Err(BridgeError::protocol(format!("unexpected {other:?} during RECV")));
                }
            }
        }
        conn.close();
        writer.flush().await?;

        info!(
            src = src_path,
            size = %display_size(received),
            elapsed = ?started.elapsed(),
            "Download finished"
        );
        Ok(received)
    }

    /// Uploads a local file.
    pub async fn upload_file(
        &self,
        cancel: &CancellationToken,
        source: &Path,
        dest_path: &str,
        options: TransferOptions,
    ) -> Result<()> {
        let file = fs_err::tokio::File::open(source).await.map_err(BridgeError::local_io(source))?;
        let size = file.metadata().await.map_err(BridgeError::local_io(source))?.len();
        debug!(source = %source.display(), size = %display_size(size), "Uploading file");
        self.upload(cancel, file, size, dest_path, options).await
    }

    /// Downloads into a local file, creating or truncating it.
    pub async fn download_file(
        &self,
        cancel: &CancellationToken,
        src_path: &str,
        dest: &Path,
        options: TransferOptions,
    ) -> Result<u64> {
        let file = fs_err::tokio::File::create(dest).await.map_err(BridgeError::local_io(dest))?;
        self.download(cancel, src_path, file, options).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use tempfile::tempdir;

    use super::*;
    use crate::{adb::testing::*, error::ErrorKind};

    fn recorder() -> (Arc<Mutex<Vec<TransferProgress>>>, impl FnMut(TransferProgress) + Send) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |p| sink.lock().unwrap().push(p))
    }

    async fn device(state: FakeState) -> (FakeServer, AdbDevice) {
        let fake = FakeServer::start(state.with_device("SER1 offline")).await;
        let device = fake.server().get_device("SER1").await.unwrap();
        (fake, device)
    }

    #[test]
    fn du_output_parsing() {
        assert_eq!(parse_du_output("10000\t/sdcard/file\n"), Some(10_000));
        assert_eq!(parse_du_output("du: /nope: No such file or directory"), None);
        assert_eq!(parse_du_output(""), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn upload_reports_every_chunk() {
        let (fake, device) = device(FakeState::default()).await;
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let (seen, on_progress) = recorder();

        device
            .upload(
                &CancellationToken::new(),
                data.as_slice(),
                data.len() as u64,
                "/sdcard/blob.bin",
                TransferOptions::default().with_chunk_size(1_000).on_progress(on_progress),
            )
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 10);
        assert!(seen.windows(2).all(|w| w[0].bytes_transferred < w[1].bytes_transferred));
        assert_eq!(seen.last().unwrap().bytes_transferred, 10_000);
        assert!(seen.iter().all(|p| p.total_bytes == 10_000));
        assert_eq!(fake.file("/sdcard/blob.bin").unwrap(), data);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn upload_stops_at_chunk_boundary_when_cancelled() {
        let (fake, device) = device(FakeState::default()).await;
        let data = vec![7u8; 10_000];
        let cancel = CancellationToken::new();
        let (seen, mut record) = recorder();
        let trigger = cancel.clone();

        let err = device
            .upload(
                &cancel,
                data.as_slice(),
                data.len() as u64,
                "/sdcard/partial.bin",
                TransferOptions::default().with_chunk_size(1_000).on_progress(move |p| {
                    record(p);
                    if p.bytes_transferred >= 3_000 {
                        trigger.cancel();
                    }
                }),
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Cancelled);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen.last().unwrap().bytes_transferred <= 10_000);
        assert!(fake.file("/sdcard/partial.bin").is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn upload_surfaces_server_failure() {
        let (_fake, device) = device(FakeState::default()).await;
        let err = device
            .upload(
                &CancellationToken::new(),
                &b"abc"[..],
                3,
                "/system/app.bin",
                TransferOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Rejected);
        assert_eq!(err.diagnostic(), Some("Read-only file system"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn download_reports_against_du_total() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 13) as u8).collect();
        let state = FakeState { recv_chunk: 1_000, ..Default::default() }
            .with_shell("shell:du -b /sdcard/blob.bin", "10000\t/sdcard/blob.bin\n");
        let (fake, device) = device(state).await;
        fake.put_file("/sdcard/blob.bin", data.clone());
        let (seen, on_progress) = recorder();

        let mut sink = Vec::new();
        let n = device
            .download(
                &CancellationToken::new(),
                "/sdcard/blob.bin",
                &mut sink,
                TransferOptions::default().on_progress(on_progress),
            )
            .await
            .unwrap();

        assert_eq!(n, 10_000);
        assert_eq!(sink, data);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 10);
        assert!(seen.iter().all(|p| p.total_bytes == 10_000));
        assert_eq!(seen.last().unwrap().bytes_transferred, 10_000);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn download_cancel_and_missing_file() {
        let state = FakeState { recv_chunk: 1_000, ..Default::default() }
            .with_shell("shell:du -b /sdcard/big.bin", "5000 /sdcard/big.bin\n");
        let (fake, device) = device(state).await;
        fake.put_file("/sdcard/big.bin", vec![1u8; 5_000]);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let (seen, mut record) = recorder();
        let err = device
            .download(
                &cancel,
                "/sdcard/big.bin",
                tokio::io::sink(),
                TransferOptions::default().on_progress(move |p| {
                    record(p);
                    trigger.cancel();
                }),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(seen.lock().unwrap().len(), 1);

        fake.remove_file("/sdcard/big.bin");
        let err = device
            .download(
                &CancellationToken::new(),
                "/sdcard/big.bin",
                tokio::io::sink(),
                TransferOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Rejected);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn upload_rejects_reader_longer_than_announced() {
        let (fake, device) = device(FakeState::default()).await;
        let data = vec![3u8; 3_000];
        let (seen, on_progress) = recorder();

        let err = device
            .upload(
                &CancellationToken::new(),
                data.as_slice(),
                1_000,
                "/sdcard/short.bin",
                TransferOptions::default().with_chunk_size(1_000).on_progress(on_progress),
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen.iter().all(|p| p.bytes_transferred <= p.total_bytes));
        assert!(fake.file("/sdcard/short.bin").is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn download_fails_without_remote_size() {
        let state = FakeState { recv_chunk: 1_000, ..Default::default() }
            .with_shell("shell:du -b /sdcard/blob.bin", "du: invalid option -- b\n");
        let (fake, device) = device(state).await;
        fake.put_file("/sdcard/blob.bin", vec![9u8; 3_000]);
        let (seen, on_progress) = recorder();

        let mut sink = Vec::new();
        let err = device
            .download(
                &CancellationToken::new(),
                "/sdcard/blob.bin",
                &mut sink,
                TransferOptions::default().on_progress(on_progress),
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Parse);
        assert!(seen.lock().unwrap().is_empty());
        assert!(sink.is_empty());
        assert!(!fake.requests().iter().any(|r| r == "sync:"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn download_stops_when_file_outgrows_its_size() {
        let state = FakeState { recv_chunk: 1_000, ..Default::default() }
            .with_shell("shell:du -b /sdcard/log.txt", "1500\t/sdcard/log.txt\n");
        let (fake, device) = device(state).await;
        fake.put_file("/sdcard/log.txt", vec![b'x'; 3_000]);
        let (seen, on_progress) = recorder();

        let err = device
            .download(
                &CancellationToken::new(),
                "/sdcard/log.txt",
                tokio::io::sink(),
                TransferOptions::default().on_progress(on_progress),
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Protocol);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen.iter().all(|p| p.bytes_transferred <= 1_500));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn local_file_failures_are_local_io() {
        let (fake, device) = device(
            FakeState::default().with_shell("shell:du -b /sdcard/in.txt", "5\t/sdcard/in.txt\n"),
        )
        .await;
        fake.put_file("/sdcard/in.txt", b"hello".to_vec());
        let dir = tempdir().unwrap();
        let cancel = CancellationToken::new();

        let missing = dir.path().join("missing.bin");
        let err = device
            .upload_file(&cancel, &missing, "/sdcard/missing.bin", TransferOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LocalIo);

        let unwritable = dir.path().join("no/such/dir/out.txt");
        let err = device
            .download_file(&cancel, "/sdcard/in.txt", &unwritable, TransferOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LocalIo);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn file_helpers_round_trip() {
        let dir = tempdir().unwrap();
        let local = dir.path().join("in.txt");
        std::fs::write(&local, b"hello device").unwrap();
        let (fake, device) = device(
            FakeState::default().with_shell("shell:du -b /sdcard/in.txt", "12\t/sdcard/in.txt\n"),
        )
        .await;
        let cancel = CancellationToken::new();

        device
            .upload_file(&cancel, &local, "/sdcard/in.txt", TransferOptions::default())
            .await
            .unwrap();
        assert_eq!(fake.file("/sdcard/in.txt").unwrap(), b"hello device");

        let out = dir.path().join("out.txt");
        let n = device
            .download_file(&cancel, "/sdcard/in.txt", &out, TransferOptions::default())
            .await
            .unwrap();
        assert_eq!(n, 12);
        assert_eq!(std::fs::read(&out).unwrap(), b"hello device");
    }
}
