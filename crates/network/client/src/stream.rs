//! Bridges an inbound transport stream into the tick-driven consumer.
//!
//! A background task pulls messages off the stream and offers them to a
//! [`MergeBuffer`]. The consumer calls [`StreamReceiver::poll`] once per tick;
//! it never waits for data and sees at most one merged message per call.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use futures::{FutureExt, StreamExt};
use network_shared::transport::{InboundStream, TransportError};
use thiserror::Error;
use tokio::{runtime::Handle, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::{
    LOG_TARGET,
    health::ThroughputWindow,
    merge_buffer::{MergeBuffer, Offered},
};

#[derive(Debug, Error)]
pub enum ReceiverError {
    #[error("receiver already started")]
    AlreadyStarted,
    #[error("inbound stream failed: {0}")]
    Transport(#[from] TransportError),
    #[error("receiver task stopped abnormally: {0}")]
    Task(String),
}

pub struct StreamReceiver<T> {
    name: &'static str,
    buffer: Option<Arc<MergeBuffer<T>>>,
    task: Option<JoinHandle<Result<(), TransportError>>>,
    cancel: CancellationToken,
    received: ThroughputWindow,
}

impl<T> StreamReceiver<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(name: &'static str, window: Duration) -> Self {
        Self {
            name,
            buffer: None,
            task: None,
            cancel: CancellationToken::new(),
            received: ThroughputWindow::new(window),
        }
    }

    /// Spawns the read loop on `handle`. A receiver can be started once.
    pub fn start<F>(
        &mut self,
        handle: &Handle,
        stream: InboundStream<T>,
        merge: F,
    ) -> Result<(), ReceiverError>
    where
        F: Fn(&mut T, &T) + Send + Sync + 'static,
    {
        if self.buffer.is_some() {
            return Err(ReceiverError::AlreadyStarted);
        }

        let buffer = Arc::new(MergeBuffer::new(merge));
        let task = handle.spawn(read_loop(
            self.name,
            stream,
            Arc::clone(&buffer),
            self.cancel.clone(),
        ));
        self.buffer = Some(buffer);
        self.task = Some(task);
        debug!(target: LOG_TARGET, stream = self.name, "receiver started");
        Ok(())
    }

    /// Takes the merged message, if any. Once the buffer is drained, a
    /// failed read loop surfaces its error here exactly once.
    pub fn poll(&mut self, now: Instant) -> Result<Option<T>, ReceiverError> {
        let Some(buffer) = &self.buffer else {
            return Ok(None);
        };
        if let Some(item) = buffer.take_if_present() {
            self.received.record(now);
            return Ok(Some(item));
        }
        self.check_task()?;
        Ok(None)
    }

    /// Like [`poll`](Self::poll), handing the message to `on_merged`.
    pub fn poll_with<F>(&mut self, now: Instant, on_merged: F) -> Result<bool, ReceiverError>
    where
        F: FnOnce(T),
    {
        match self.poll(now)? {
            Some(item) => {
                on_merged(item);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn check_task(&mut self) -> Result<(), ReceiverError> {
        if !self.task.as_ref().is_some_and(JoinHandle::is_finished) {
            return Ok(());
        }
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        let outcome = match task.now_or_never() {
            Some(Ok(result)) => result.map_err(ReceiverError::from),
            Some(Err(join)) => Err(ReceiverError::Task(join.to_string())),
            None => Ok(()),
        };
        match outcome {
            Err(err) if !self.cancel.is_cancelled() => Err(err),
            _ => Ok(()),
        }
    }

    /// Merged messages delivered within the throughput window.
    pub fn received_in_window(&mut self, now: Instant) -> usize {
        self.received.count(now)
    }

    pub fn is_started(&self) -> bool {
        self.buffer.is_some()
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stops the read loop. It exits at its next read without an error.
    pub fn close(&mut self) {
        if !self.cancel.is_cancelled() {
            debug!(target: LOG_TARGET, stream = self.name, "receiver closing");
        }
        self.cancel.cancel();
    }
}

impl<T> Drop for StreamReceiver<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn read_loop<T>(
    name: &'static str,
    mut stream: InboundStream<T>,
    buffer: Arc<MergeBuffer<T>>,
    cancel: CancellationToken,
) -> Result<(), TransportError>
where
    T: Clone + Send + Sync + 'static,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            next = stream.next() => next,
        };

        match next {
            Some(Ok(item)) => {
                if buffer.offer(item) == Offered::Merged {
                    trace!(target: LOG_TARGET, stream = name, "coalesced into pending message");
                }
            }
            Some(Err(err)) => {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                error!(target: LOG_TARGET, stream = name, error = %err, "inbound stream failed");
                return Err(err);
            }
            None => {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                error!(target: LOG_TARGET, stream = name, "inbound stream ended");
                return Err(TransportError::StreamEnded);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use tokio::sync::mpsc;

    fn channel_stream() -> (
        mpsc::UnboundedSender<Result<Vec<u32>, TransportError>>,
        InboundStream<Vec<u32>>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let stream =
            stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) })
                .boxed();
        (tx, stream)
    }

    fn concat(existing: &mut Vec<u32>, incoming: &Vec<u32>) {
        existing.extend_from_slice(incoming);
    }

    async fn poll_until<T: Clone + Send + Sync + 'static>(
        receiver: &mut StreamReceiver<T>,
    ) -> Result<T, ReceiverError> {
        loop {
            if let Some(item) = receiver.poll(Instant::now())? {
                return Ok(item);
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[test_log::test(tokio::test)]
    async fn burst_is_coalesced_into_one_delivery() {
        let (tx, stream) = channel_stream();
        let mut receiver = StreamReceiver::new("test", Duration::from_secs(1));
        receiver
            .start(&Handle::current(), stream, concat)
            .unwrap();

        for i in 0..5 {
            tx.send(Ok(vec![i])).unwrap();
        }

        let mut seen = Vec::new();
        while seen.len() < 5 {
            seen.extend(poll_until(&mut receiver).await.unwrap());
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert!(receiver.received_in_window(Instant::now()) >= 1);
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let mut receiver = StreamReceiver::<Vec<u32>>::new("test", Duration::from_secs(1));
        let handle = Handle::current();
        receiver
            .start(&handle, stream::pending().boxed(), concat)
            .unwrap();
        assert!(matches!(
            receiver.start(&handle, stream::pending().boxed(), concat),
            Err(ReceiverError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn empty_poll_is_a_no_op() {
        let mut receiver = StreamReceiver::<Vec<u32>>::new("test", Duration::from_secs(1));
        assert!(receiver.poll(Instant::now()).unwrap().is_none());

        receiver
            .start(&Handle::current(), stream::pending().boxed(), concat)
            .unwrap();
        assert!(!receiver.poll_with(Instant::now(), |_| panic!("no data")).unwrap());
    }

    #[test_log::test(tokio::test)]
    async fn stream_failure_surfaces_after_pending_data() {
        let (tx, stream) = channel_stream();
        let mut receiver = StreamReceiver::new("test", Duration::from_secs(1));
        receiver
            .start(&Handle::current(), stream, concat)
            .unwrap();

        tx.send(Ok(vec![7])).unwrap();
        tx.send(Err(TransportError::Other("boom".into()))).unwrap();
        while receiver.is_running() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        assert_eq!(receiver.poll(Instant::now()).unwrap(), Some(vec![7]));
        assert!(matches!(
            receiver.poll(Instant::now()),
            Err(ReceiverError::Transport(TransportError::Other(_)))
        ));
        // Reported once.
        assert!(receiver.poll(Instant::now()).unwrap().is_none());
    }

    #[tokio::test]
    async fn hang_up_is_stream_ended() {
        let (tx, stream) = channel_stream();
        let mut receiver = StreamReceiver::new("test", Duration::from_secs(1));
        receiver
            .start(&Handle::current(), stream, concat)
            .unwrap();
        drop(tx);

        let err = poll_until(&mut receiver).await.unwrap_err();
        assert!(matches!(
            err,
            ReceiverError::Transport(TransportError::StreamEnded)
        ));
    }

    #[test_log::test(tokio::test)]
    async fn close_is_not_an_error() {
        let (tx, stream) = channel_stream();
        let mut receiver = StreamReceiver::new("test", Duration::from_secs(1));
        receiver
            .start(&Handle::current(), stream, concat)
            .unwrap();

        receiver.close();
        drop(tx);
        while receiver.is_running() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(receiver.poll(Instant::now()).unwrap().is_none());
    }
}
