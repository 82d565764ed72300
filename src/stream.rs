//! Merges the stdout and stderr of every worker into two farm-wide streams.
//!
//! Each chunk remembers which worker produced it. Chunks from one worker keep
//! their order; chunks from different workers interleave arbitrarily.

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// A piece of output from one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    /// 1-indexed worker id.
    pub worker_id: usize,
    pub data: Vec<u8>,
}

/// Aggregated output of all workers on one channel (stdout or stderr).
///
/// The stream ends once the farm has shut down and every worker pipe is closed.
#[derive(Debug)]
pub struct OutputStream {
    rx: mpsc::UnboundedReceiver<OutputChunk>,
}

impl OutputStream {
    /// Next chunk from any worker, or `None` at end of stream.
    pub async fn recv(&mut self) -> Option<OutputChunk> {
        self.rx.recv().await
    }

    /// Collect everything until the stream ends.
    pub async fn read_to_end(&mut self) -> Vec<u8> {
        let mut buf = Vec::new();
        while let Some(chunk) = self.rx.recv().await {
            buf.extend_from_slice(&chunk.data);
        }
        buf
    }

    /// Collect everything until the stream ends, replacing invalid UTF-8.
    pub async fn read_to_string(&mut self) -> String {
        String::from_utf8_lossy(&self.read_to_end().await).into_owned()
    }
}

/// Fan-in point for worker output pipes.
#[derive(Debug, Clone)]
pub struct StreamAggregator {
    stdout: mpsc::UnboundedSender<OutputChunk>,
    stderr: mpsc::UnboundedSender<OutputChunk>,
}

impl StreamAggregator {
    /// Create an aggregator and the two streams it feeds.
    pub fn new() -> (Self, OutputStream, OutputStream) {
        let (stdout, stdout_rx) = mpsc::unbounded_channel();
        let (stderr, stderr_rx) = mpsc::unbounded_channel();
        (
            Self { stdout, stderr },
            OutputStream { rx: stdout_rx },
            OutputStream { rx: stderr_rx },
        )
    }

    /// Forward a worker's pipes until they close.
    pub fn attach<O, E>(&self, worker_id: usize, stdout: Option<O>, stderr: Option<E>)
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        if let Some(pipe) = stdout {
            tokio::spawn(pump(worker_id, pipe, self.stdout.clone()));
        }
        if let Some(pipe) = stderr {
            tokio::spawn(pump(worker_id, pipe, self.stderr.clone()));
        }
    }
}

async fn pump<R>(worker_id: usize, mut pipe: R, tx: mpsc::UnboundedSender<OutputChunk>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let chunk = OutputChunk {
                    worker_id,
                    data: buf[..n].to_vec(),
                };
                // Nobody is listening any more; keep draining so the child never blocks.
                let _ = tx.send(chunk);
            }
            Err(e) => {
                tracing::debug!(worker_id, error = %e, "Worker output pipe failed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_chunks_are_tagged_and_forwarded() {
        let (aggregator, mut stdout, mut stderr) = StreamAggregator::new();
        let (mut out_w, out_r) = tokio::io::duplex(64);
        let (mut err_w, err_r) = tokio::io::duplex(64);

        aggregator.attach(2, Some(out_r), Some(err_r));
        drop(aggregator);

        out_w.write_all(b"hello ").await.unwrap();
        out_w.write_all(b"world").await.unwrap();
        drop(out_w);
        err_w.write_all(b"oops").await.unwrap();
        drop(err_w);

        assert_eq!(stdout.read_to_string().await, "hello world");

        let chunk = stderr.recv().await.unwrap();
        assert_eq!(chunk.worker_id, 2);
        assert_eq!(chunk.data, b"oops");
        assert!(stderr.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_multiple_workers_merge_into_one_stream() {
        let (aggregator, mut stdout, _stderr) = StreamAggregator::new();
        let (mut a_w, a_r) = tokio::io::duplex(64);
        let (mut b_w, b_r) = tokio::io::duplex(64);

        aggregator.attach(1, Some(a_r), None::<tokio::io::DuplexStream>);
        aggregator.attach(2, Some(b_r), None::<tokio::io::DuplexStream>);
        drop(aggregator);

        a_w.write_all(b"a").await.unwrap();
        b_w.write_all(b"b").await.unwrap();
        drop(a_w);
        drop(b_w);

        let mut merged = stdout.read_to_end().await;
        merged.sort();
        assert_eq!(merged, b"ab");
    }

    #[tokio::test]
    async fn test_stream_ends_without_workers() {
        let (aggregator, mut stdout, mut stderr) = StreamAggregator::new();
        drop(aggregator);
        assert!(stdout.read_to_end().await.is_empty());
        assert!(stderr.recv().await.is_none());
    }
}
