//! Per-client send mailbox
//!
//! Every client owns one mailbox drained by exactly one writer task, so at most
//! one payload is ever in flight on the socket and payloads reach the wire in
//! enqueue order. When a bounded mailbox is full the whole backlog is shed: every
//! queued waiter is failed and the enqueue itself reports resource exhaustion.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::metrics::TransportMetrics;
use crate::error::{Result, TransportError};

/// Resolves once the payload has been written, or with the reason it never was
pub type SendCompletion = oneshot::Receiver<Result<()>>;

struct SendRequest {
    data: Bytes,
    done: oneshot::Sender<Result<()>>,
}

#[derive(Default)]
struct MailboxState {
    pending: VecDeque<SendRequest>,
    closed: bool,
}

pub struct SendMailbox {
    client_id: Uuid,
    capacity: Option<usize>,
    state: Mutex<MailboxState>,
    ready: Notify,
}

impl SendMailbox {
    pub fn new(client_id: Uuid, capacity: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            client_id,
            capacity,
            state: Mutex::new(MailboxState::default()),
            ready: Notify::new(),
        })
    }

    /// Queues `data` for the writer task.
    pub fn enqueue(&self, data: Bytes) -> Result<SendCompletion> {
        let (done, completion) = oneshot::channel();
        let mut state = self.state.lock();
        if state.closed {
            return Err(TransportError::ClientNotFound {
                client_id: self.client_id,
            });
        }

        if let Some(capacity) = self.capacity {
            if state.pending.len() >= capacity {
                let shed: Vec<SendRequest> = state.pending.drain(..).collect();
                drop(state);

                warn!(
                    client = %self.client_id,
                    dropped = shed.len(),
                    capacity,
                    "Send queue overflow, shedding queued payloads"
                );
                for request in shed {
                    let _ = request
                        .done
                        .send(Err(TransportError::queue_cleared(self.client_id, "send queue overflow")));
                }
                return Err(TransportError::resource_exhausted(
                    "send_queue",
                    format!(
                        "client {} exceeded {} queued sends; queue was cleared",
                        self.client_id, capacity
                    ),
                ));
            }
        }

        state.pending.push_back(SendRequest { data, done });
        drop(state);
        self.ready.notify_one();
        Ok(completion)
    }

    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rejects further sends and fails everything still queued.
    pub fn close(&self, reason: &str) {
        let shed: Vec<SendRequest> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.pending.drain(..).collect()
        };
        for request in shed {
            let _ = request
                .done
                .send(Err(TransportError::queue_cleared(self.client_id, reason)));
        }
        self.ready.notify_one();
    }

    async fn next(&self) -> Option<SendRequest> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(request) = state.pending.pop_front() {
                    return Some(request);
                }
                if state.closed {
                    return None;
                }
            }
            self.ready.notified().await;
        }
    }
}

/// Drains `mailbox` into `writer` one payload at a time until cancelled or closed.
///
/// A write error is reported to the waiting caller; errors that mean the peer is
/// gone also end the writer and are returned.
pub async fn run_writer<W>(
    mailbox: Arc<SendMailbox>,
    mut writer: W,
    metrics: TransportMetrics,
    cancel: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let request = tokio::select! {
            _ = cancel.cancelled() => break,
            next = mailbox.next() => match next {
                Some(request) => request,
                None => break,
            },
        };

        let length = request.data.len();
        let written = async {
            writer.write_all(&request.data).await?;
            writer.flush().await
        }
        .await;

        match written {
            Ok(()) => {
                metrics.record_send(length);
                debug!(client = %mailbox.client_id, bytes = length, "Payload sent");
                let _ = request.done.send(Ok(()));
            }
            Err(e) => {
                let err = TransportError::from(e);
                metrics.record_error();
                if err.is_disconnect() {
                    let _ = request.done.send(Err(TransportError::connection(
                        format!("send failed: {err}"),
                        None,
                    )));
                    mailbox.close("connection closed");
                    return Err(err);
                }
                let _ = request.done.send(Err(err));
            }
        }
    }

    mailbox.close("connection closed");
    let _ = writer.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_payloads_written_in_enqueue_order() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mailbox = SendMailbox::new(Uuid::new_v4(), None);
        let cancel = CancellationToken::new();
        let writer = tokio::spawn(run_writer(
            mailbox.clone(),
            client,
            TransportMetrics::new(),
            cancel.clone(),
        ));

        let mut completions = Vec::new();
        for i in 0..32u8 {
            completions.push(mailbox.enqueue(Bytes::from(vec![i])).unwrap());
        }
        for completion in completions {
            completion.await.unwrap().unwrap();
        }

        let mut received = [0u8; 32];
        server.read_exact(&mut received).await.unwrap();
        assert_eq!(received.to_vec(), (0..32u8).collect::<Vec<_>>());

        cancel.cancel();
        writer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_senders_all_delivered() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let mailbox = SendMailbox::new(Uuid::new_v4(), None);
        let metrics = TransportMetrics::new();
        let cancel = CancellationToken::new();
        tokio::spawn(run_writer(mailbox.clone(), client, metrics.clone(), cancel.clone()));

        let mut tasks = Vec::new();
        for i in 0..100u8 {
            let mailbox = mailbox.clone();
            tasks.push(tokio::spawn(async move {
                mailbox.enqueue(Bytes::from(vec![i; 4])).unwrap().await.unwrap()
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let mut received = vec![0u8; 400];
        server.read_exact(&mut received).await.unwrap();
        for chunk in received.chunks(4) {
            assert!(chunk.iter().all(|b| *b == chunk[0]), "payloads interleaved");
        }
        assert_eq!(metrics.snapshot().payloads_sent, 100);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_overflow_sheds_whole_queue() {
        let mailbox = SendMailbox::new(Uuid::new_v4(), Some(2));
        let first = mailbox.enqueue(Bytes::from_static(b"one")).unwrap();
        let second = mailbox.enqueue(Bytes::from_static(b"two")).unwrap();

        let overflow = mailbox.enqueue(Bytes::from_static(b"three"));
        assert!(matches!(overflow, Err(TransportError::ResourceExhausted { .. })));
        assert!(matches!(first.await.unwrap(), Err(TransportError::QueueCleared { .. })));
        assert!(matches!(second.await.unwrap(), Err(TransportError::QueueCleared { .. })));
        assert!(mailbox.is_empty());

        // Nothing from the shed backlog reaches the wire afterwards
        let (client, mut server) = tokio::io::duplex(1024);
        let cancel = CancellationToken::new();
        tokio::spawn(run_writer(mailbox.clone(), client, TransportMetrics::new(), cancel.clone()));
        mailbox.enqueue(Bytes::from_static(b"four")).unwrap().await.unwrap().unwrap();
        cancel.cancel();

        let mut received = Vec::new();
        server.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"four");
    }

    #[tokio::test]
    async fn test_closed_mailbox_rejects_sends() {
        let mailbox = SendMailbox::new(Uuid::new_v4(), None);
        let pending = mailbox.enqueue(Bytes::from_static(b"x")).unwrap();
        mailbox.close("disconnected");
        assert!(matches!(pending.await.unwrap(), Err(TransportError::QueueCleared { .. })));
        assert!(matches!(
            mailbox.enqueue(Bytes::from_static(b"y")),
            Err(TransportError::ClientNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_broken_pipe_ends_writer_and_closes_mailbox() {
        let writer = tokio_test::io::Builder::new()
            .write(b"one")
            .write_error(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "peer gone"))
            .build();
        let mailbox = SendMailbox::new(Uuid::new_v4(), None);
        let metrics = TransportMetrics::new();

        let first = mailbox.enqueue(Bytes::from_static(b"one")).unwrap();
        let second = mailbox.enqueue(Bytes::from_static(b"two")).unwrap();
        let result = run_writer(mailbox.clone(), writer, metrics.clone(), CancellationToken::new()).await;

        assert!(matches!(result, Err(ref e) if e.is_disconnect()));
        assert!(first.await.unwrap().is_ok());
        assert!(second.await.unwrap().is_err());
        assert!(matches!(
            mailbox.enqueue(Bytes::from_static(b"three")),
            Err(TransportError::ClientNotFound { .. })
        ));
        assert_eq!(metrics.snapshot().payloads_sent, 1);
    }
}
