use std::collections::VecDeque;
use std::sync::Arc;

use bytes::BytesMut;
use log::{debug, error, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{span, Level};

use crate::connection::ConnectionShared;
use crate::parser::{decode, Decoded};
use crate::protocol::RESP;
use crate::pubsub;
use crate::types::{ClientError, ResultT};

pub(crate) enum PipelineRequest {
    /// Enqueue a response promise and write the message. The very next
    /// unclaimed inbound value resolves the promise.
    Send {
        message: RESP,
        response: oneshot::Sender<ResultT<RESP>>,
    },
    /// Subscription traffic: the reply arrives as a push frame, so the
    /// promise resolves as soon as the bytes are written.
    SendConfirmedByPush {
        message: RESP,
        written: oneshot::Sender<ResultT<()>>,
    },
    Close {
        done: oneshot::Sender<ResultT<()>>,
    },
}

enum PipelineState {
    Default,
    Draining { done: oneshot::Sender<ResultT<()>> },
    Errored(ClientError),
}

/// Per-connection request/response matcher. Owns both socket halves, pairs
/// each accepted write with the next inbound value in strict FIFO order,
/// and drives the close/drain/error state machine.
pub(crate) struct Pipeline<R, W> {
    reader: R,
    writer: W,
    requests: mpsc::UnboundedReceiver<PipelineRequest>,
    pushes: mpsc::UnboundedSender<RESP>,
    shared: Arc<ConnectionShared>,
    buffer: BytesMut,
    queue: VecDeque<oneshot::Sender<ResultT<RESP>>>,
    state: PipelineState,
}

impl<R, W> Pipeline<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send,
{
    pub(crate) fn new(
        reader: R,
        writer: W,
        requests: mpsc::UnboundedReceiver<PipelineRequest>,
        pushes: mpsc::UnboundedSender<RESP>,
        shared: Arc<ConnectionShared>,
    ) -> Pipeline<R, W> {
        Pipeline {
            reader,
            writer,
            requests,
            pushes,
            shared,
            buffer: BytesMut::with_capacity(4096),
            queue: VecDeque::with_capacity(16),
            state: PipelineState::Default,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(request) => {
                        if self.handle_request(request).await {
                            break;
                        }
                    }
                    None => {
                        // every handle dropped; nobody can observe the queue
                        self.set_terminal(&ClientError::ConnectionClosed);
                        self.fail_queue(&ClientError::ConnectionClosed);
                        let _ = self.writer.shutdown().await;
                        break;
                    }
                },
                read = self.reader.read_buf(&mut self.buffer) => match read {
                    Ok(0) => {
                        self.transport_closed().await;
                        break;
                    }
                    Ok(n) => {
                        debug!("read {} bytes from socket on connection {}", n, self.shared.id);
                        if self.drain_frames().await {
                            break;
                        }
                    }
                    Err(err) => {
                        self.fail_connection(err.into()).await;
                        break;
                    }
                },
            }
        }
        debug_assert!(
            self.queue.is_empty(),
            "command queue must be empty at connection teardown"
        );
    }

    /// Returns true when the connection reached a terminal state and the
    /// task should exit.
    async fn handle_request(&mut self, request: PipelineRequest) -> bool {
        match request {
            PipelineRequest::Send { message, response } => match self.state {
                PipelineState::Default => {
                    if let Err(err) = self.write_message(message).await {
                        let _ = response.send(Err(err.clone()));
                        self.fail_connection(err).await;
                        return true;
                    }
                    self.queue.push_back(response);
                    false
                }
                PipelineState::Draining { .. } => {
                    let _ = response.send(Err(ClientError::ConnectionClosed));
                    false
                }
                PipelineState::Errored(ref err) => {
                    let _ = response.send(Err(err.clone()));
                    false
                }
            },
            PipelineRequest::SendConfirmedByPush { message, written } => match self.state {
                PipelineState::Default => match self.write_message(message).await {
                    Ok(()) => {
                        let _ = written.send(Ok(()));
                        false
                    }
                    Err(err) => {
                        let _ = written.send(Err(err.clone()));
                        self.fail_connection(err).await;
                        true
                    }
                },
                PipelineState::Draining { .. } => {
                    let _ = written.send(Err(ClientError::ConnectionClosed));
                    false
                }
                PipelineState::Errored(ref err) => {
                    let _ = written.send(Err(err.clone()));
                    false
                }
            },
            PipelineRequest::Close { done } => self.handle_close(done).await,
        }
    }

    async fn write_message(&mut self, message: RESP) -> ResultT<()> {
        let flush =
            self.shared.sends_immediately() || self.requests.is_empty();
        message.write_async(&mut self.writer, flush).await
    }

    async fn handle_close(&mut self, done: oneshot::Sender<ResultT<()>>) -> bool {
        match self.state {
            PipelineState::Default => {
                if self.queue.is_empty() {
                    self.state = PipelineState::Errored(ClientError::ConnectionClosed);
                    self.set_terminal(&ClientError::ConnectionClosed);
                    let result = self.writer.shutdown().await.map_err(ClientError::from);
                    let _ = done.send(result);
                    true
                } else {
                    debug!(
                        "draining {} in-flight commands on connection {}",
                        self.queue.len(),
                        self.shared.id
                    );
                    self.state = PipelineState::Draining { done };
                    false
                }
            }
            PipelineState::Draining { .. } | PipelineState::Errored(_) => {
                let _ = done.send(Ok(()));
                false
            }
        }
    }

    /// Parse and dispatch every complete value in the buffer. Returns true
    /// when the connection reached a terminal state.
    async fn drain_frames(&mut self) -> bool {
        loop {
            match decode(&self.buffer) {
                Err(err) => {
                    self.fail_connection(err).await;
                    return true;
                }
                Ok(Decoded::Incomplete) => return false,
                Ok(Decoded::Parsed { value, consumed }) => {
                    self.buffer = self.buffer.split_off(consumed);
                    self.dispatch_frame(value);
                    if self.finish_drain_if_done().await {
                        return true;
                    }
                }
            }
        }
    }

    fn dispatch_frame(&mut self, value: RESP) {
        let span = span!(Level::DEBUG, "frame received");
        let _guard = span.enter();
        if self.shared.allows_subscriptions() && pubsub::is_push_frame(&value) {
            if self.pushes.send(value).is_err() {
                warn!(
                    "dropping push frame on connection {}: no receiver installed",
                    self.shared.id
                );
            }
            return;
        }
        match self.queue.pop_front() {
            None => {
                debug!(
                    "discarding frame with no waiting command on connection {}",
                    self.shared.id
                );
            }
            Some(promise) => match value {
                RESP::Error(text) => {
                    self.shared.record_failure();
                    let _ = promise.send(Err(ClientError::Server(text)));
                }
                value => {
                    self.shared.record_success();
                    let _ = promise.send(Ok(value));
                }
            },
        }
    }

    async fn finish_drain_if_done(&mut self) -> bool {
        let drained =
            matches!(self.state, PipelineState::Draining { .. }) && self.queue.is_empty();
        if !drained {
            return false;
        }
        let state = std::mem::replace(
            &mut self.state,
            PipelineState::Errored(ClientError::ConnectionClosed),
        );
        self.set_terminal(&ClientError::ConnectionClosed);
        if let PipelineState::Draining { done } = state {
            let result = self.writer.shutdown().await.map_err(ClientError::from);
            let _ = done.send(result);
        }
        true
    }

    /// The remote closed the socket. A requested close completes; anything
    /// else is an unexpected closure.
    async fn transport_closed(&mut self) {
        let state = std::mem::replace(
            &mut self.state,
            PipelineState::Errored(ClientError::ConnectionClosed),
        );
        self.set_terminal(&ClientError::ConnectionClosed);
        if let PipelineState::Default = state {
            self.shared.fire_unexpected_closure();
        }
        self.fail_queue(&ClientError::ConnectionClosed);
        let _ = self.writer.shutdown().await;
        if let PipelineState::Draining { done } = state {
            let _ = done.send(Ok(()));
        }
    }

    async fn fail_connection(&mut self, err: ClientError) {
        error!("connection {} failed: {}", self.shared.id, err);
        let state = std::mem::replace(&mut self.state, PipelineState::Errored(err.clone()));
        self.set_terminal(&err);
        self.fail_queue(&err);
        let _ = self.writer.shutdown().await;
        if let PipelineState::Draining { done } = state {
            let _ = done.send(Err(err));
        }
    }

    fn fail_queue(&mut self, err: &ClientError) {
        while let Some(promise) = self.queue.pop_front() {
            self.shared.record_failure();
            let _ = promise.send(Err(err.clone()));
        }
    }

    fn set_terminal(&mut self, err: &ClientError) {
        self.shared.set_terminal(err.clone());
    }
}
