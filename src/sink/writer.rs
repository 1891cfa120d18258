use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::buffer::TraceBuffer;
use super::Sample;

/// Output target for [`SampleWriter`].
pub type Output = Box<dyn AsyncWrite + Send + Unpin>;

/// Open the configured output: `-` for stdout, otherwise a file path
/// (created or truncated).
pub async fn open_output(path: &str) -> Result<Output> {
    if path == "-" {
        return Ok(Box::new(tokio::io::stdout()));
    }

    let file = tokio::fs::File::create(Path::new(path))
        .await
        .with_context(|| format!("creating output file {path}"))?;
    Ok(Box::new(tokio::io::BufWriter::new(file)))
}

/// Background task draining a [`TraceBuffer`] as newline-delimited JSON.
pub struct SampleWriter<W> {
    task: JoinHandle<Result<(W, u64)>>,
}

impl<W> SampleWriter<W>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    /// Spawn the writer. It flushes every `flush_interval` and performs a
    /// final drain once `cancel` fires.
    pub fn spawn(
        buffer: Arc<TraceBuffer>,
        out: W,
        flush_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let task = tokio::spawn(write_loop(buffer, out, flush_interval, cancel));
        Self { task }
    }

    /// Wait for the writer to finish; returns the output and the number of
    /// samples written.
    pub async fn wait(self) -> Result<(W, u64)> {
        self.task.await.context("waiting for sample writer")?
    }
}

async fn write_loop<W>(
    buffer: Arc<TraceBuffer>,
    mut out: W,
    flush_interval: Duration,
    cancel: CancellationToken,
) -> Result<(W, u64)>
where
    W: AsyncWrite + Send + Unpin,
{
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut batch: Vec<Sample> = Vec::with_capacity(buffer.capacity().min(4096));
    let mut encoded: Vec<u8> = Vec::with_capacity(64 * 1024);
    let mut total = 0u64;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                total += flush(&buffer, &mut batch, &mut encoded, &mut out).await?;
                break;
            }
            _ = ticker.tick() => {
                total += flush(&buffer, &mut batch, &mut encoded, &mut out).await?;
            }
        }
    }

    out.flush().await.context("flushing sample output")?;
    debug!(samples = total, "sample writer stopped");

    Ok((out, total))
}

async fn flush<W>(
    buffer: &TraceBuffer,
    batch: &mut Vec<Sample>,
    encoded: &mut Vec<u8>,
    out: &mut W,
) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let n = buffer.drain_into(batch);
    if n == 0 {
        return Ok(0);
    }

    for sample in batch.drain(..) {
        serde_json::to_writer(&mut *encoded, &sample).context("encoding sample")?;
        encoded.push(b'\n');
    }

    out.write_all(encoded)
        .await
        .context("writing samples")?;
    out.flush().await.context("flushing sample output")?;
    encoded.clear();

    Ok(n as u64)
}
