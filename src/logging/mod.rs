//! Async logging sink (ambient stack), generalized from the teacher's
//! single-file `Logger`/`AsyncWriter` pair into the per-path registry
//! the server lifecycle module (C11) needs for multiple named log
//! files.

use std::io::{self, Write};

use env_logger::Builder;
use log::LevelFilter;
use tokio::fs::{create_dir_all, metadata, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// A `Write`-compatible sink that forwards bytes to a background task
/// over an unbounded channel, so logging calls never block on file I/O.
#[derive(Clone)]
pub struct AsyncWriter {
    sender: UnboundedSender<Vec<u8>>,
}

impl Write for AsyncWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sender
            .send(buf.to_vec())
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Owns the sending end of one log file's channel; the draining task
/// is spawned alongside it and runs until the sender is dropped.
pub struct LogFile {
    sender: UnboundedSender<Vec<u8>>,
    path: String,
}

impl LogFile {
    pub fn new(path: impl Into<String>) -> Self {
        let (sender, receiver) = unbounded_channel::<Vec<u8>>();
        let path = path.into();
        let log_path = path.clone();
        tokio::spawn(run_writer(log_path, receiver));
        LogFile { sender, path }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn writer(&self) -> AsyncWriter {
        AsyncWriter { sender: self.sender.clone() }
    }

    pub fn init_env_logger(&self) {
        let writer = self.writer();
        Builder::from_env(env_logger::Env::default())
            .filter(None, LevelFilter::Info)
            .target(env_logger::Target::Pipe(Box::new(writer)))
            .init();
    }
}

async fn run_writer(log_path: String, mut receiver: UnboundedReceiver<Vec<u8>>) {
    if let Some(parent) = std::path::Path::new(&log_path).parent() {
        if metadata(parent).await.is_err() {
            if let Err(e) = create_dir_all(parent).await {
                log::error!("failed to create log directory {}: {e}", parent.display());
                return;
            }
        }
    }

    let file = match OpenOptions::new().write(true).append(true).create(true).open(&log_path).await {
        Ok(file) => file,
        Err(e) => {
            log::error!("failed to open log file {log_path}: {e}");
            return;
        }
    };
    let mut file = BufWriter::new(file);

    while let Some(data) = receiver.recv().await {
        if let Err(e) = file.write_all(&data).await {
            log::error!("failed to write to log file {log_path}: {e}");
        }
    }

    if let Err(e) = file.flush().await {
        log::error!("failed to flush log file {log_path}: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn writes_reach_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sixcore.log");
        let log_file = LogFile::new(path.to_string_lossy().to_string());
        let mut writer = log_file.writer();
        writer.write_all(b"hello\n").unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents, "hello\n");
    }
}
