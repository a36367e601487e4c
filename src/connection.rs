use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, info};
use tokio::io::{AsyncRead, AsyncWrite, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

use crate::pipeline::{Pipeline, PipelineRequest};
use crate::protocol::{command, RESP};
use crate::types::{ClientError, FactoryConfig, ResultT};

static CONNECTION_EPOCH: AtomicU64 = AtomicU64::new(0);

const SUBSCRIBE_FAMILY: [&str; 4] = ["SUBSCRIBE", "UNSUBSCRIBE", "PSUBSCRIBE", "PUNSUBSCRIBE"];

fn is_subscribe_family(name: &str) -> bool {
    SUBSCRIBE_FAMILY.iter().any(|c| name.eq_ignore_ascii_case(c))
}

pub(crate) type ClosureHook = Box<dyn FnOnce() + Send>;

/// State shared between the `Connection` handles and the pipeline task.
pub(crate) struct ConnectionShared {
    pub(crate) id: u64,
    allow_subscriptions: AtomicBool,
    send_immediately: AtomicBool,
    closed: AtomicBool,
    terminal: Mutex<Option<ClientError>>,
    successes: AtomicU64,
    failures: AtomicU64,
    on_unexpected_closure: Mutex<Option<ClosureHook>>,
    push_receiver: Mutex<Option<mpsc::UnboundedReceiver<RESP>>>,
}

impl ConnectionShared {
    pub(crate) fn allows_subscriptions(&self) -> bool {
        self.allow_subscriptions.load(Ordering::SeqCst)
    }

    pub(crate) fn sends_immediately(&self) -> bool {
        self.send_immediately.load(Ordering::SeqCst)
    }

    pub(crate) fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Keeps the first terminal error; later ones describe the same death.
    pub(crate) fn set_terminal(&self, err: ClientError) {
        let mut terminal = self.terminal.lock().unwrap();
        if terminal.is_none() {
            *terminal = Some(err);
        }
        self.closed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn fire_unexpected_closure(&self) {
        let hook = self.on_unexpected_closure.lock().unwrap().take();
        if let Some(hook) = hook {
            info!("connection {} closed unexpectedly", self.id);
            hook();
        }
    }
}

/// Handle to one Redis connection: a socket pair driven by a pipeline task.
/// Cloning is cheap and every clone talks to the same underlying socket.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<ConnectionShared>,
    requests: mpsc::UnboundedSender<PipelineRequest>,
}

impl Connection {
    /// Builds a connection over an arbitrary transport and spawns its
    /// pipeline task on the current runtime.
    pub(crate) fn from_parts<R, W>(reader: R, writer: W) -> Connection
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (pushes_tx, pushes_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ConnectionShared {
            id: CONNECTION_EPOCH.fetch_add(1, Ordering::SeqCst),
            allow_subscriptions: AtomicBool::new(false),
            send_immediately: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            terminal: Mutex::new(None),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            on_unexpected_closure: Mutex::new(None),
            push_receiver: Mutex::new(Some(pushes_rx)),
        });
        tokio::spawn(
            Pipeline::new(reader, writer, requests_rx, pushes_tx, shared.clone()).run(),
        );
        Connection {
            shared,
            requests: requests_tx,
        }
    }

    /// Opens a TCP connection and performs the `AUTH` / `SELECT` handshake.
    pub async fn connect(
        addr: std::net::SocketAddr,
        config: &FactoryConfig,
    ) -> ResultT<Connection> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        let connection = Connection::from_parts(reader, BufWriter::new(writer));
        debug!("connection {} established to {}", connection.id(), addr);
        if let Err(err) = connection.handshake(config).await {
            let _ = connection.close().await;
            return Err(err);
        }
        Ok(connection)
    }

    async fn handshake(&self, config: &FactoryConfig) -> ResultT<()> {
        if let Some(password) = &config.password {
            let reply = self
                .send(command("AUTH", vec![RESP::bulk(password.clone())]))
                .await
                .map_err(|err| ClientError::Handshake(err.to_string()))?;
            if reply.as_text() != Some("OK") {
                return Err(ClientError::Handshake(format!(
                    "AUTH rejected: {:?}",
                    reply
                )));
            }
        }
        if let Some(database) = config.initial_database {
            let reply = self
                .send(command("SELECT", vec![RESP::bulk(database.to_string())]))
                .await
                .map_err(|err| ClientError::Handshake(err.to_string()))?;
            if reply.as_text() != Some("OK") {
                return Err(ClientError::Handshake(format!(
                    "SELECT rejected: {:?}",
                    reply
                )));
            }
        }
        Ok(())
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Sends one command (`[NAME, arg, ...]` parts) and resolves with the
    /// paired response. Subscribe-family commands are rejected before
    /// touching the wire unless subscriptions are enabled.
    pub async fn send(&self, parts: Vec<RESP>) -> ResultT<RESP> {
        if let Some(name) = parts.first().and_then(|p| p.as_text()) {
            if is_subscribe_family(name) && !self.allow_subscriptions() {
                return Err(ClientError::SubscriptionsNotAllowed);
            }
        }
        if self.is_closed() {
            return Err(self.terminal_error());
        }
        let (response_tx, response_rx) = oneshot::channel();
        let request = PipelineRequest::Send {
            message: RESP::Array(Some(parts)),
            response: response_tx,
        };
        if self.requests.send(request).is_err() {
            return Err(self.terminal_error());
        }
        match response_rx.await {
            Ok(result) => result,
            Err(_) => Err(self.terminal_error()),
        }
    }

    /// Writes a subscribe-family command whose confirmation arrives as a
    /// push frame; resolves once the bytes are accepted.
    pub(crate) async fn send_subscription_change(&self, parts: Vec<RESP>) -> ResultT<()> {
        let (written_tx, written_rx) = oneshot::channel();
        let request = PipelineRequest::SendConfirmedByPush {
            message: RESP::Array(Some(parts)),
            written: written_tx,
        };
        if self.requests.send(request).is_err() {
            return Err(self.terminal_error());
        }
        match written_rx.await {
            Ok(result) => result,
            Err(_) => Err(self.terminal_error()),
        }
    }

    /// Graceful close: in-flight commands drain, new writes are refused.
    /// The request is issued immediately; the returned future resolves once
    /// the socket has shut down. Closing a closed connection succeeds.
    pub fn close(&self) -> impl Future<Output = ResultT<()>> {
        let (done_tx, done_rx) = oneshot::channel();
        let sent = self
            .requests
            .send(PipelineRequest::Close { done: done_tx })
            .is_ok();
        async move {
            if !sent {
                return Ok(());
            }
            match done_rx.await {
                Ok(result) => result,
                Err(_) => Ok(()),
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn allow_subscriptions(&self) -> bool {
        self.shared.allows_subscriptions()
    }

    pub fn set_allow_subscriptions(&self, allow: bool) {
        self.shared
            .allow_subscriptions
            .store(allow, Ordering::SeqCst);
    }

    /// When false, writes are flushed only when the request queue runs dry,
    /// batching pipelined commands into fewer syscalls.
    pub fn set_send_commands_immediately(&self, immediately: bool) {
        self.shared
            .send_immediately
            .store(immediately, Ordering::SeqCst);
    }

    /// `(successes, failures)` over the connection's lifetime.
    pub fn command_counts(&self) -> (u64, u64) {
        (
            self.shared.successes.load(Ordering::Relaxed),
            self.shared.failures.load(Ordering::Relaxed),
        )
    }

    /// Installs the hook fired exactly once if the socket closes without a
    /// caller-requested close. Replaces any previous hook.
    pub fn set_on_unexpected_closure(&self, hook: impl FnOnce() + Send + 'static) {
        *self.shared.on_unexpected_closure.lock().unwrap() = Some(Box::new(hook));
    }

    pub(crate) fn take_push_receiver(&self) -> Option<mpsc::UnboundedReceiver<RESP>> {
        self.shared.push_receiver.lock().unwrap().take()
    }

    pub(crate) fn restore_push_receiver(&self, receiver: mpsc::UnboundedReceiver<RESP>) {
        *self.shared.push_receiver.lock().unwrap() = Some(receiver);
    }

    fn terminal_error(&self) -> ClientError {
        self.shared
            .terminal
            .lock()
            .unwrap()
            .clone()
            .unwrap_or(ClientError::ConnectionClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::command;
    use std::sync::atomic::AtomicBool;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn test_connection() -> (Connection, DuplexStream) {
        let (client, server) = tokio::io::duplex(4096);
        let (reader, writer) = tokio::io::split(client);
        (Connection::from_parts(reader, writer), server)
    }

    async fn read_some(server: &mut DuplexStream) -> Vec<u8> {
        let mut buf = vec![0u8; 1024];
        let n = server.read(&mut buf).await.unwrap();
        buf.truncate(n);
        buf
    }

    #[tokio::test]
    async fn test_fifo_pairing() -> ResultT<()> {
        let (connection, mut server) = test_connection();

        let ping = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.send(command("PING", vec![])).await })
        };
        let mut received = Vec::new();
        while received.len() < b"*1\r\n$4\r\nPING\r\n".len() {
            received.extend(read_some(&mut server).await);
        }

        // the second command is accepted only after the first hit the wire
        let echo = {
            let connection = connection.clone();
            tokio::spawn(async move {
                connection
                    .send(command("ECHO", vec![RESP::bulk("hi")]))
                    .await
            })
        };
        let total = b"*1\r\n$4\r\nPING\r\n*2\r\n$4\r\nECHO\r\n$2\r\nhi\r\n".len();
        while received.len() < total {
            received.extend(read_some(&mut server).await);
        }

        server.write_all(b"+PONG\r\n$2\r\nhi\r\n").await.unwrap();

        assert_eq!(ping.await.unwrap()?, RESP::simple("PONG"));
        assert_eq!(echo.await.unwrap()?, RESP::bulk("hi"));
        assert_eq!(connection.command_counts(), (2, 0));
        Ok(())
    }

    #[tokio::test]
    async fn test_server_error_fails_only_that_command() -> ResultT<()> {
        let (connection, mut server) = test_connection();

        let first = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.send(command("GET", vec![RESP::bulk("k")])).await })
        };
        read_some(&mut server).await;
        server
            .write_all(b"-WRONGTYPE not a string\r\n")
            .await
            .unwrap();
        match first.await.unwrap() {
            Err(ClientError::Server(text)) => assert_eq!(text, "WRONGTYPE not a string"),
            other => panic!("expected server error, got {:?}", other),
        }

        // the connection is still usable
        let second = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.send(command("PING", vec![])).await })
        };
        read_some(&mut server).await;
        server.write_all(b"+PONG\r\n").await.unwrap();
        assert_eq!(second.await.unwrap()?, RESP::simple("PONG"));
        assert_eq!(connection.command_counts(), (1, 1));
        Ok(())
    }

    #[tokio::test]
    async fn test_all_queued_promises_fail_on_closure() {
        let (connection, mut server) = test_connection();

        let first = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.send(command("PING", vec![])).await })
        };
        let second = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.send(command("PING", vec![])).await })
        };
        let expected = b"*1\r\n$4\r\nPING\r\n*1\r\n$4\r\nPING\r\n".len();
        let mut received = Vec::new();
        while received.len() < expected {
            received.extend(read_some(&mut server).await);
        }
        drop(server);

        assert!(matches!(
            first.await.unwrap(),
            Err(ClientError::ConnectionClosed)
        ));
        assert!(matches!(
            second.await.unwrap(),
            Err(ClientError::ConnectionClosed)
        ));
        assert!(matches!(
            connection.send(command("PING", vec![])).await,
            Err(ClientError::ConnectionClosed)
        ));
        assert!(connection.is_closed());
    }

    #[tokio::test]
    async fn test_graceful_drain() -> ResultT<()> {
        let (connection, mut server) = test_connection();

        let pending = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.send(command("PING", vec![])).await })
        };
        read_some(&mut server).await;

        // close while one command is in flight
        let close = connection.close();

        // writes after close are refused without reaching the wire
        assert!(matches!(
            connection.send(command("PING", vec![])).await,
            Err(ClientError::ConnectionClosed)
        ));

        server.write_all(b"+PONG\r\n").await.unwrap();
        assert_eq!(pending.await.unwrap()?, RESP::simple("PONG"));
        close.await?;

        // the socket shut down after the drain
        let mut buf = [0u8; 8];
        assert_eq!(server.read(&mut buf).await.unwrap(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_close_idle_connection() -> ResultT<()> {
        let (connection, mut server) = test_connection();
        connection.close().await?;
        let mut buf = [0u8; 8];
        assert_eq!(server.read(&mut buf).await.unwrap(), 0);
        // closing again still succeeds
        connection.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_subscribe_guard_is_synchronous() {
        let (connection, _server) = test_connection();
        assert!(matches!(
            connection
                .send(command("SUBSCRIBE", vec![RESP::bulk("news")]))
                .await,
            Err(ClientError::SubscriptionsNotAllowed)
        ));
    }

    #[tokio::test]
    async fn test_push_frames_route_past_the_queue() -> ResultT<()> {
        let (connection, mut server) = test_connection();
        connection.set_allow_subscriptions(true);
        let mut pushes = connection.take_push_receiver().unwrap();

        let pending = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.send(command("PING", vec![])).await })
        };
        read_some(&mut server).await;

        // a push frame arrives before the command response
        server
            .write_all(b"*3\r\n$7\r\nmessage\r\n$4\r\nnews\r\n$5\r\nhello\r\n+PONG\r\n")
            .await
            .unwrap();

        assert_eq!(pending.await.unwrap()?, RESP::simple("PONG"));
        let frame = pushes.recv().await.unwrap();
        assert_eq!(
            frame,
            RESP::Array(Some(vec![
                RESP::bulk("message"),
                RESP::bulk("news"),
                RESP::bulk("hello"),
            ]))
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_spurious_frame_is_discarded() -> ResultT<()> {
        let (connection, mut server) = test_connection();
        server.write_all(b"+EXTRA\r\n").await.unwrap();

        let pending = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.send(command("PING", vec![])).await })
        };
        read_some(&mut server).await;
        server.write_all(b"+PONG\r\n").await.unwrap();
        assert_eq!(pending.await.unwrap()?, RESP::simple("PONG"));
        Ok(())
    }

    #[tokio::test]
    async fn test_unexpected_closure_hook_fires_once() {
        let (connection, mut server) = test_connection();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        connection.set_on_unexpected_closure(move || flag.store(true, Ordering::SeqCst));

        let pending = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.send(command("PING", vec![])).await })
        };
        read_some(&mut server).await;
        drop(server);

        assert!(pending.await.unwrap().is_err());
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_requested_close_does_not_fire_hook() -> ResultT<()> {
        let (connection, _server) = test_connection();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        connection.set_on_unexpected_closure(move || flag.store(true, Ordering::SeqCst));
        connection.close().await?;
        assert!(!fired.load(Ordering::SeqCst));
        Ok(())
    }

    #[tokio::test]
    async fn test_malformed_reply_errors_the_connection() {
        let (connection, mut server) = test_connection();
        let pending = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.send(command("PING", vec![])).await })
        };
        read_some(&mut server).await;
        server.write_all(b"!bogus\r\n").await.unwrap();

        assert!(matches!(
            pending.await.unwrap(),
            Err(ClientError::Protocol(_))
        ));
        assert!(matches!(
            connection.send(command("PING", vec![])).await,
            Err(ClientError::Protocol(_))
        ));
    }
}
