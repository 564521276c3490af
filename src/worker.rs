use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::fmt::Display;
use tokio::sync::mpsc;

use crate::metrics::ACTIVE_STREAMS;
use crate::models::StreamChunk;
use crate::sse::SseTranscoder;

// What the relay hands to the client side of the stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Chunk(StreamChunk),
    Error(String),
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    Completed,
    Failed,
    // client went away; upstream body dropped unread
    Aborted,
}

struct ActiveStream;

impl ActiveStream {
    fn enter() -> Self {
        ACTIVE_STREAMS.inc();
        ActiveStream
    }
}

impl Drop for ActiveStream {
    fn drop(&mut self) {
        ACTIVE_STREAMS.dec();
    }
}

/// Relays one upstream event stream to `tx` in upstream order.
///
/// Returns as soon as the transcoder sees a terminal marker, the upstream
/// ends, or the receiving side is dropped. `upstream` is dropped on return,
/// which for a reqwest body closes the connection.
pub async fn stream_worker<S, E>(upstream: S, tx: mpsc::Sender<StreamEvent>) -> StreamEnd
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    let _active = ActiveStream::enter();
    let mut upstream = std::pin::pin!(upstream);
    let mut transcoder = SseTranscoder::new();

    loop {
        let next = tokio::select! {
            biased;
            _ = tx.closed() => {
                tracing::info!("client disconnected, aborting upstream stream");
                return StreamEnd::Aborted;
            }
            next = upstream.next() => next,
        };

        let (chunks, finished) = match next {
            Some(Ok(bytes)) => {
                let chunks = transcoder.feed(&bytes);
                (chunks, transcoder.is_finished())
            }
            Some(Err(e)) => {
                tracing::error!(error = %e, "upstream stream failed mid-response");
                crate::metrics::UPSTREAM_ERRORS.inc();
                let _ = tx
                    .send(StreamEvent::Error("Upstream stream interrupted".to_string()))
                    .await;
                return StreamEnd::Failed;
            }
            // connection close counts as a normal end
            None => (transcoder.finish(), true),
        };

        for chunk in chunks {
            if tx.send(StreamEvent::Chunk(chunk)).await.is_err() {
                return StreamEnd::Aborted;
            }
        }
        if finished {
            if tx.send(StreamEvent::Done).await.is_err() {
                return StreamEnd::Aborted;
            }
            if transcoder.skipped() > 0 {
                tracing::debug!(skipped = transcoder.skipped(), "stream finished with skipped chunks");
            }
            return StreamEnd::Completed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn delta(text: &str) -> Bytes {
        Bytes::from(format!(
            "data: {{\"choices\":[{{\"delta\":{{\"content\":\"{text}\"}}}}]}}\n\n"
        ))
    }

    async fn collect(mut rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        while let Some(event) = rx.recv().await {
            out.push(event);
        }
        out
    }

    fn chunk(text: &str) -> StreamEvent {
        StreamEvent::Chunk(StreamChunk {
            text: text.to_string(),
            finish_reason: None,
        })
    }

    #[tokio::test]
    async fn relays_chunks_in_order_then_done() {
        let upstream = stream::iter(vec![
            Ok::<_, std::io::Error>(delta("a")),
            Ok(delta("b")),
            Ok(Bytes::from_static(b"data: [DONE]\n\n")),
        ]);
        let (tx, rx) = mpsc::channel(4);
        let end = stream_worker(upstream, tx).await;
        assert_eq!(end, StreamEnd::Completed);
        assert_eq!(collect(rx).await, vec![chunk("a"), chunk("b"), StreamEvent::Done]);
    }

    #[tokio::test]
    async fn upstream_close_without_marker_still_completes() {
        let upstream = stream::iter(vec![Ok::<_, std::io::Error>(delta("a"))]);
        let (tx, rx) = mpsc::channel(4);
        assert_eq!(stream_worker(upstream, tx).await, StreamEnd::Completed);
        assert_eq!(collect(rx).await, vec![chunk("a"), StreamEvent::Done]);
    }

    #[tokio::test]
    async fn mid_stream_failure_sends_error_event() {
        let upstream = stream::iter(vec![
            Ok(delta("a")),
            Err(std::io::Error::other("connection reset")),
        ]);
        let (tx, rx) = mpsc::channel(4);
        assert_eq!(stream_worker(upstream, tx).await, StreamEnd::Failed);
        let events = collect(rx).await;
        assert_eq!(events[0], chunk("a"));
        assert!(matches!(events[1], StreamEvent::Error(_)));
        assert_eq!(events.len(), 2);
    }

    // Flags when the upstream body is dropped, like a reqwest body closing its socket
    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn client_disconnect_aborts_upstream() {
        let dropped = Arc::new(AtomicBool::new(false));
        let flag = DropFlag(dropped.clone());
        let upstream = stream::iter(vec![Ok::<_, std::io::Error>(delta("a"))])
            .chain(stream::pending())
            .map(move |item| {
                let _flag = &flag;
                item
            });

        let (tx, mut rx) = mpsc::channel(4);
        let worker = tokio::spawn(stream_worker(upstream, tx));

        assert_eq!(rx.recv().await, Some(chunk("a")));
        drop(rx);

        let end = tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .expect("worker should stop after disconnect")
            .unwrap();
        assert_eq!(end, StreamEnd::Aborted);
        assert!(dropped.load(Ordering::SeqCst));
    }
}
