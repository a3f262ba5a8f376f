//! Producer side of a run's event stream.

use std::future::Future;

use agent_relay_core::protocol::Event;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::EventStream;

/// Events buffered between a run and its consumer before the run blocks.
pub const EVENT_BUFFER: usize = 64;

/// The consumer dropped its end of the stream; the run should stop.
#[derive(Debug, Error)]
#[error("event consumer went away")]
pub struct SinkClosed;

#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<Event>,
}

impl EventSink {
    /// Send one event, waiting while the consumer is behind.
    pub async fn emit(&self, event: Event) -> Result<(), SinkClosed> {
        self.tx.send(event).await.map_err(|_| SinkClosed)
    }
}

/// Spawn `run` on the runtime and hand back the stream it writes into.
pub fn spawn_run<F, Fut>(run: F) -> EventStream
where
    F: FnOnce(EventSink) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    tokio::spawn(run(EventSink { tx }));
    Box::pin(ReceiverStream::new(rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let stream = spawn_run(|sink| async move {
            for i in 0..3 {
                let _ = sink.emit(Event::text_chunk("m", i.to_string())).await;
            }
        });
        let events: Vec<Event> = stream.collect().await;
        assert_eq!(
            events,
            vec![
                Event::text_chunk("m", "0"),
                Event::text_chunk("m", "1"),
                Event::text_chunk("m", "2"),
            ]
        );
    }

    #[tokio::test]
    async fn test_dropped_consumer_stops_producer() {
        let stopped = Arc::new(AtomicBool::new(false));
        let flag = stopped.clone();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();

        let stream = spawn_run(move |sink| async move {
            loop {
                if sink.emit(Event::text_chunk("m", "x")).await.is_err() {
                    flag.store(true, Ordering::SeqCst);
                    let _ = done_tx.send(());
                    return;
                }
            }
        });
        drop(stream);

        done_rx.await.unwrap();
        assert!(stopped.load(Ordering::SeqCst));
    }
}
