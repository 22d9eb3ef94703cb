//! Line-oriented front end for the in-memory backend
//!
//! With no queue service behind the relay, each stdin line becomes an
//! inbound message and every message released to the outbound queue is
//! written to stdout as one line.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::queue::{QueueClient, ReceiveMessageRequest, SendMessageRequest};

/// Send every non-blank line of `reader` to the inbound queue
///
/// Returns the number of messages sent once the reader hits EOF.
pub async fn feed_lines<R>(reader: R, client: &dyn QueueClient, inbound_queue_url: &str) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut sent = 0;

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let message_id = client
            .send_message(SendMessageRequest {
                queue_url: inbound_queue_url.to_string(),
                body: line,
                message_attributes: Default::default(),
                delay_seconds: 0,
            })
            .await?;
        debug!(%message_id, "feed_lines: queued line");
        sent += 1;
    }

    info!(count = sent, "Input closed");
    Ok(sent)
}

/// Receive once from the outbound queue, writing and deleting what arrives
pub async fn drain_once<W>(
    client: &dyn QueueClient,
    outbound_queue_url: &str,
    wait_time_seconds: u32,
    writer: &mut W,
) -> Result<usize>
where
    W: AsyncWrite + Unpin,
{
    let request = ReceiveMessageRequest::single_with_all_attributes(outbound_queue_url, wait_time_seconds);
    let messages = client.receive_messages(request).await?;

    let mut written = 0;
    for msg in messages {
        writer.write_all(msg.body.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        written += 1;

        if let Err(e) = client.delete_message(outbound_queue_url, &msg.receipt_handle).await {
            warn!(message_id = %msg.message_id, error = %e, "Failed to delete released message");
        }
    }
    Ok(written)
}

/// Write released messages to `writer` until shutdown
///
/// A dropped shutdown sender counts as shutdown.
pub async fn drain_outbound<W>(
    client: &dyn QueueClient,
    outbound_queue_url: &str,
    wait_time_seconds: u32,
    writer: &mut W,
    mut shutdown_rx: mpsc::Receiver<()>,
) -> Result<usize>
where
    W: AsyncWrite + Unpin,
{
    // zero would spin on an empty queue
    let wait_time_seconds = wait_time_seconds.max(1);
    let mut total = 0;

    loop {
        match shutdown_rx.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }

        total += tokio::select! {
            result = drain_once(client, outbound_queue_url, wait_time_seconds, writer) => result?,
            _ = shutdown_rx.recv() => break,
        };
    }

    debug!(total, "drain_outbound: stopped");
    Ok(total)
}
