//! Live deployment streaming over a duplex connection

use std::sync::Arc;

use futures::Sink;
use tokio::sync::oneshot;
use tracing::debug;

use crate::deploy::progress::{ProgressFrame, ProgressReporter};
use crate::deploy::queue::{DeployQueue, LiveObserver};
use crate::deploy::sink::{ChannelSink, FrameSink, OutputSink};
use crate::errors::ShipError;
use crate::models::job::{DeployJob, JobStatus};

/// Output chunks buffered for a live viewer before further chunks are dropped
pub const LIVE_OUTPUT_BUFFER: usize = 256;

/// Enqueue a deployment and stream it to `sink` until it finishes.
///
/// Raw output and `[PROGRESS]` frames share the sink; the run ends with a
/// `[COMPLETE]` or `[ERROR]` frame. Returns the finished job.
///
/// The worker only ever hands output to a bounded buffer, so a viewer that
/// stops reading loses output instead of holding up the queue.
pub async fn stream_deployment<S, E>(
    queue: &DeployQueue,
    project_name: &str,
    branch: &str,
    sink: Arc<FrameSink<S>>,
) -> Result<DeployJob, ShipError>
where
    S: Sink<String, Error = E> + Unpin + Send + 'static,
    E: std::fmt::Display + 'static,
{
    let (progress, mut progress_rx) = ProgressReporter::channel();
    let (output, mut output_rx) = ChannelSink::bounded(LIVE_OUTPUT_BUFFER);
    let (finished_tx, finished_rx) = oneshot::channel();

    let observer = LiveObserver {
        output: Arc::new(output) as Arc<dyn OutputSink>,
        progress,
        finished: finished_tx,
    };

    let job = match queue.enqueue_observed(project_name, branch, observer) {
        Ok(job) => job,
        Err(e) => {
            let _ = sink.send_frame(&ProgressFrame::Error(e.to_string())).await;
            return Err(e);
        }
    };

    // both senders are dropped once the worker is done with the job, which
    // ends this relay
    let relay_sink = sink.clone();
    let relay = tokio::spawn(async move {
        let mut progress_open = true;
        let mut output_open = true;
        while progress_open || output_open {
            let sent = tokio::select! {
                progress = progress_rx.recv(), if progress_open => match progress {
                    Some(progress) => relay_sink.send_frame(&ProgressFrame::Progress(progress)).await,
                    None => {
                        progress_open = false;
                        Ok(())
                    }
                },
                chunk = output_rx.recv(), if output_open => match chunk {
                    Some(chunk) => relay_sink.send_text(chunk).await,
                    None => {
                        output_open = false;
                        Ok(())
                    }
                },
            };
            if let Err(e) = sent {
                debug!("Live relay stopped: {}", e);
                break;
            }
        }
    });

    let finished = finished_rx.await;
    let _ = relay.await;
    let finished = match finished {
        Ok(job) => job,
        Err(_) => {
            let message = format!("Deployment {} was cancelled", job.id);
            let _ = sink.send_frame(&ProgressFrame::Error(message.clone())).await;
            return Err(ShipError::Internal(message));
        }
    };

    let frame = match finished.status {
        JobStatus::Completed => ProgressFrame::Complete("Deployment completed successfully".to_string()),
        _ => ProgressFrame::Error(
            finished
                .error
                .clone()
                .unwrap_or_else(|| "Deployment failed".to_string()),
        ),
    };
    sink.send_frame(&frame).await?;

    Ok(finished)
}
