//! Appendable output sinks for streamed deployment output

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::{Sink, SinkExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace};

use crate::deploy::progress::ProgressFrame;
use crate::deploy::store::JobStore;
use crate::errors::ShipError;

/// Destination for streamed command output.
///
/// Implementations serialize concurrent writers themselves; callers may share
/// one sink between tasks.
#[async_trait]
pub trait OutputSink: Send + Sync {
    /// Append raw bytes
    async fn write(&self, bytes: &[u8]) -> Result<(), ShipError>;

    /// Push out any buffered partial data
    async fn flush(&self) -> Result<(), ShipError> {
        Ok(())
    }
}

/// Write one newline-terminated line
pub async fn write_line(sink: &dyn OutputSink, line: &str) -> Result<(), ShipError> {
    let mut data = String::with_capacity(line.len() + 1);
    data.push_str(line);
    data.push('\n');
    sink.write(data.as_bytes()).await
}

/// Sink that splits output into lines and appends them to a job's log
pub struct JobOutputSink {
    store: Arc<JobStore>,
    job_id: String,
    partial: Mutex<Vec<u8>>,
}

impl JobOutputSink {
    pub fn new(store: Arc<JobStore>, job_id: impl Into<String>) -> Self {
        Self {
            store,
            job_id: job_id.into(),
            partial: Mutex::new(Vec::new()),
        }
    }

    fn take_lines(&self, bytes: &[u8]) -> Vec<String> {
        let mut partial = self.partial.lock().unwrap_or_else(|e| e.into_inner());
        partial.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(pos) = partial.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = partial.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]);
            lines.push(text.trim_end_matches('\r').to_string());
        }
        lines
    }
}

#[async_trait]
impl OutputSink for JobOutputSink {
    async fn write(&self, bytes: &[u8]) -> Result<(), ShipError> {
        let lines = self.take_lines(bytes);
        if !lines.is_empty() {
            self.store.append_output(&self.job_id, lines)?;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), ShipError> {
        let rest = {
            let mut partial = self.partial.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *partial)
        };
        if !rest.is_empty() {
            let line = String::from_utf8_lossy(&rest).trim_end_matches('\r').to_string();
            self.store.append_output(&self.job_id, vec![line])?;
        }
        Ok(())
    }
}

/// Sink writing text frames to a live connection.
///
/// Deployment output and progress frames are written by different tasks; the
/// inner mutex keeps each frame whole.
pub struct FrameSink<S> {
    inner: tokio::sync::Mutex<S>,
}

impl<S, E> FrameSink<S>
where
    S: Sink<String, Error = E> + Unpin + Send,
    E: std::fmt::Display,
{
    pub fn new(inner: S) -> Self {
        Self {
            inner: tokio::sync::Mutex::new(inner),
        }
    }

    pub async fn send_text(&self, text: String) -> Result<(), ShipError> {
        let mut inner = self.inner.lock().await;
        inner
            .send(text)
            .await
            .map_err(|e| ShipError::ServerError(format!("connection write failed: {}", e)))
    }

    pub async fn send_frame(&self, frame: &ProgressFrame) -> Result<(), ShipError> {
        self.send_text(frame.to_string()).await
    }

    pub async fn close(&self) -> Result<(), ShipError> {
        let mut inner = self.inner.lock().await;
        inner
            .close()
            .await
            .map_err(|e| ShipError::ServerError(format!("connection close failed: {}", e)))
    }
}

#[async_trait]
impl<S, E> OutputSink for FrameSink<S>
where
    S: Sink<String, Error = E> + Unpin + Send,
    E: std::fmt::Display,
{
    async fn write(&self, bytes: &[u8]) -> Result<(), ShipError> {
        self.send_text(String::from_utf8_lossy(bytes).into_owned()).await
    }
}

/// Sink handing output chunks to a bounded channel without waiting.
///
/// A full channel drops the chunk; a closed one reports an error. The writer
/// never waits on whoever drains the receiver.
pub struct ChannelSink {
    tx: mpsc::Sender<String>,
}

impl ChannelSink {
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl OutputSink for ChannelSink {
    async fn write(&self, bytes: &[u8]) -> Result<(), ShipError> {
        match self.tx.try_send(String::from_utf8_lossy(bytes).into_owned()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                trace!("Output channel full, dropping {} bytes", bytes.len());
                Ok(())
            }
            Err(TrySendError::Closed(_)) => {
                Err(ShipError::ServerError("output receiver is gone".to_string()))
            }
        }
    }
}

/// Sink duplicating output to a primary sink and best-effort observers.
///
/// Only primary failures are reported; an observer that went away must not
/// abort the deployment feeding it.
pub struct TeeSink {
    primary: Arc<dyn OutputSink>,
    observers: Vec<Arc<dyn OutputSink>>,
}

impl TeeSink {
    pub fn new(primary: Arc<dyn OutputSink>) -> Self {
        Self {
            primary,
            observers: Vec::new(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn OutputSink>) -> Self {
        self.observers.push(observer);
        self
    }
}

#[async_trait]
impl OutputSink for TeeSink {
    async fn write(&self, bytes: &[u8]) -> Result<(), ShipError> {
        self.primary.write(bytes).await?;
        for observer in &self.observers {
            if let Err(e) = observer.write(bytes).await {
                debug!("Dropping output for detached observer: {}", e);
            }
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), ShipError> {
        self.primary.flush().await?;
        for observer in &self.observers {
            let _ = observer.flush().await;
        }
        Ok(())
    }
}
