//! Ambient logging: `log` facade + `env_logger`, with an optional
//! channel-backed file sink for the external log-sink collaborator.
//!
//! An `AsyncWriter`/`Logger` pair: a bounded channel carries formatted lines
//! to a single file-writer task, so log calls on the hot path never block on
//! disk I/O. No Pingora dependency here, so the drain loop is just a plain
//! spawned Tokio task joined on shutdown.

use std::io::{self, Write};

use env_logger::Builder;
use log::LevelFilter;
use tokio::fs::{create_dir_all, metadata, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::config::LogConfig;

/// `Write` impl that forwards every buffer to the drain task over a channel,
/// so `env_logger`'s synchronous `Write` call never blocks on file I/O.
#[derive(Clone)]
pub struct AsyncWriter {
    sender: UnboundedSender<Vec<u8>>,
}

impl Write for AsyncWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sender
            .send(buf.to_vec())
            .map_err(|e| io::Error::other(e.to_string()))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Drains buffered log lines to stderr and, if configured, to a file.
pub struct LogSink {
    receiver: UnboundedReceiver<Vec<u8>>,
    file_path: Option<String>,
}

impl LogSink {
    fn new(file_path: Option<String>) -> (Self, AsyncWriter) {
        let (sender, receiver) = unbounded_channel();
        (LogSink { receiver, file_path }, AsyncWriter { sender })
    }

    /// Runs the drain loop until the channel is closed (i.e. until every
    /// `AsyncWriter` clone is dropped).
    async fn run(mut self) {
        let mut file = match &self.file_path {
            Some(path) => match open_log_file(path).await {
                Ok(f) => Some(f),
                Err(e) => {
                    eprintln!("failed to open log file {path}: {e}");
                    None
                }
            },
            None => None,
        };

        while let Some(chunk) = self.receiver.recv().await {
            let _ = io::stderr().write_all(&chunk);
            if let Some(f) = file.as_mut() {
                if let Err(e) = f.write_all(&chunk).await {
                    eprintln!("failed to write log file: {e}");
                }
            }
        }

        if let Some(mut f) = file {
            let _ = f.flush().await;
        }
    }
}

async fn open_log_file(path: &str) -> io::Result<BufWriter<tokio::fs::File>> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() && metadata(parent).await.is_err() {
            create_dir_all(parent).await?;
        }
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    Ok(BufWriter::new(file))
}

/// Initializes `env_logger` with the configured level and, if a log path is
/// set, spawns the file-sink drain task. Returns the task handle so `main`
/// can decide whether to await it at shutdown (it only completes once every
/// logging call site has stopped writing, which in practice means process
/// exit, so `main` does not join it — it is detached on purpose).
pub fn init(config: &LogConfig) -> Option<JoinHandle<()>> {
    let level = config
        .level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::Info);

    let (sink, writer) = LogSink::new(config.path.clone());

    Builder::from_env(env_logger::Env::default())
        .filter(None, level)
        .target(env_logger::Target::Pipe(Box::new(writer)))
        .init();

    Some(tokio::spawn(sink.run()))
}
