//! Transport over any ordered byte stream (TCP, Unix sockets, in-memory duplex).
//!
//! A reader task decodes [`ServerMessage`]s with the length-prefixed codec and
//! fans them out to the three topic subscribers; a writer task drains an
//! outbound queue so that `send` never blocks the caller.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::{
    FutureExt, StreamExt,
    future::BoxFuture,
    stream,
};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::{mpsc, oneshot},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    LOG_TARGET,
    messaging::codec::{DEFAULT_MAX_MESSAGE_SIZE, read_message, write_message},
    protocol::{ClientMessage, ControlMessage, FrameUpdate, ServerMessage, StateUpdate},
};

use super::{InboundStream, MessageSink, Transport, TransportError, TransportResult};

type Outbox<T> = mpsc::UnboundedSender<TransportResult<T>>;

enum WriterCommand {
    Send(ClientMessage),
    Flush(oneshot::Sender<TransportResult<()>>),
}

#[derive(Default)]
struct Topics {
    frames: Vec<Outbox<FrameUpdate>>,
    state: Vec<Outbox<StateUpdate>>,
    control: Vec<Outbox<ControlMessage>>,
    /// Set once the reader stopped; later subscribers get an ended stream.
    finished: bool,
}

impl Topics {
    fn dispatch(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Frame(frame) => {
                self.frames.retain(|tx| tx.send(Ok(frame.clone())).is_ok())
            }
            ServerMessage::State(update) => {
                self.state.retain(|tx| tx.send(Ok(update.clone())).is_ok())
            }
            ServerMessage::Control(control) => {
                self.control.retain(|tx| tx.send(Ok(control.clone())).is_ok())
            }
        }
    }

    /// Ends every stream, optionally yielding `reason` as a last error.
    fn finish(&mut self, reason: Option<&str>) {
        self.finished = true;
        if let Some(reason) = reason {
            let err = || TransportError::Codec(reason.to_owned());
            for tx in &self.frames {
                let _ = tx.send(Err(err()));
            }
            for tx in &self.state {
                let _ = tx.send(Err(err()));
            }
            for tx in &self.control {
                let _ = tx.send(Err(err()));
            }
        }
        self.frames.clear();
        self.state.clear();
        self.control.clear();
    }
}

/// Codec-framed [`Transport`] over a split `AsyncRead + AsyncWrite`.
pub struct FramedTransport {
    outbound: mpsc::UnboundedSender<WriterCommand>,
    topics: Arc<Mutex<Topics>>,
    cancel: CancellationToken,
}

impl FramedTransport {
    /// Splits `io` and spawns the reader and writer tasks on the current runtime.
    pub fn spawn<S>(io: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        let (outbound, queue) = mpsc::unbounded_channel();
        let topics = Arc::new(Mutex::new(Topics::default()));
        let cancel = CancellationToken::new();

        tokio::spawn(read_loop(reader, Arc::clone(&topics), cancel.clone()));
        tokio::spawn(write_loop(writer, queue, cancel.clone()));

        Self {
            outbound,
            topics,
            cancel,
        }
    }

    fn topics(&self) -> MutexGuard<'_, Topics> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscribe<T, F>(&self, register: F) -> TransportResult<InboundStream<T>>
    where
        T: Send + 'static,
        F: FnOnce(&mut Topics, Outbox<T>),
    {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let mut topics = self.topics();
        if !topics.finished {
            register(&mut topics, tx);
        }
        Ok(
            stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) })
                .boxed(),
        )
    }
}

async fn read_loop<S>(mut reader: ReadHalf<S>, topics: Arc<Mutex<Topics>>, cancel: CancellationToken)
where
    S: AsyncRead + Send,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = read_message::<_, ServerMessage>(&mut reader, DEFAULT_MAX_MESSAGE_SIZE) => next,
        };

        let mut guard = topics.lock().unwrap_or_else(PoisonError::into_inner);
        match next {
            Ok(Some(message)) => guard.dispatch(message),
            Ok(None) => {
                info!(target: LOG_TARGET, "server closed the connection");
                guard.finish(None);
                return;
            }
            Err(err) => {
                let reason = format!("{err:#}");
                error!(target: LOG_TARGET, error = %reason, "framed transport read failed");
                guard.finish(Some(&reason));
                return;
            }
        }
    }

    debug!(target: LOG_TARGET, "framed reader cancelled");
    topics
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .finish(None);
}

async fn write_loop<S>(
    mut writer: WriteHalf<S>,
    mut queue: mpsc::UnboundedReceiver<WriterCommand>,
    cancel: CancellationToken,
) where
    S: AsyncWrite + Send,
{
    loop {
        let command = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            command = queue.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };

        match command {
            WriterCommand::Send(message) => {
                if let Err(err) = write_message(&mut writer, &message).await {
                    warn!(target: LOG_TARGET, error = %format!("{err:#}"), "framed transport write failed");
                    break;
                }
            }
            WriterCommand::Flush(done) => {
                let result = writer.flush().await.map_err(TransportError::from);
                let _ = done.send(result);
            }
        }
    }

    let _ = writer.shutdown().await;
    debug!(target: LOG_TARGET, "framed writer stopped");
}

impl MessageSink for FramedTransport {
    fn send(&self, message: ClientMessage) -> TransportResult<()> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.outbound
            .send(WriterCommand::Send(message))
            .map_err(|_| TransportError::NotConnected)
    }
}

impl Transport for FramedTransport {
    fn subscribe_frames(&self) -> TransportResult<InboundStream<FrameUpdate>> {
        self.subscribe(|topics, tx| topics.frames.push(tx))
    }

    fn subscribe_state(&self) -> TransportResult<InboundStream<StateUpdate>> {
        self.subscribe(|topics, tx| topics.state.push(tx))
    }

    fn subscribe_control(&self) -> TransportResult<InboundStream<ControlMessage>> {
        self.subscribe(|topics, tx| topics.control.push(tx))
    }

    fn flush(&self) -> BoxFuture<'_, TransportResult<()>> {
        async move {
            let (done, wait) = oneshot::channel();
            self.outbound
                .send(WriterCommand::Flush(done))
                .map_err(|_| TransportError::NotConnected)?;
            wait.await.map_err(|_| TransportError::NotConnected)?
        }
        .boxed()
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for FramedTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::codec::{read_message, write_message};
    use crate::{SessionToken, protocol::FrameUpdate};
    use tokio::io::duplex;

    #[tokio::test]
    async fn demultiplexes_server_messages() {
        let (client_io, mut server_io) = duplex(64 * 1024);
        let transport = FramedTransport::spawn(client_io);
        let mut frames = transport.subscribe_frames().unwrap();
        let mut state = transport.subscribe_state().unwrap();

        write_message(&mut server_io, &ServerMessage::Frame(FrameUpdate::new(4)))
            .await
            .unwrap();
        write_message(
            &mut server_io,
            &ServerMessage::State(StateUpdate::default().with_update("k", 1)),
        )
        .await
        .unwrap();
        server_io.flush().await.unwrap();

        assert_eq!(frames.next().await.unwrap().unwrap().frame_index, 4);
        assert!(state.next().await.unwrap().unwrap().updates.contains_key("k"));
    }

    #[tokio::test]
    async fn sends_and_flushes_client_messages() {
        let (client_io, mut server_io) = duplex(64 * 1024);
        let transport = FramedTransport::spawn(client_io);
        let token: SessionToken = "p1".parse().unwrap();

        let message = ClientMessage::UpdateState {
            token,
            update: StateUpdate::default().with_update("k", 2),
        };
        transport.send(message.clone()).unwrap();
        transport.flush().await.unwrap();

        let got: Option<ClientMessage> =
            read_message(&mut server_io, DEFAULT_MAX_MESSAGE_SIZE).await.unwrap();
        assert_eq!(got, Some(message));
    }

    #[tokio::test]
    async fn server_hangup_ends_streams() {
        let (client_io, server_io) = duplex(1024);
        let transport = FramedTransport::spawn(client_io);
        let mut frames = transport.subscribe_frames().unwrap();

        drop(server_io);
        assert!(frames.next().await.is_none());
    }
}
