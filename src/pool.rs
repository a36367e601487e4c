use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_retry::strategy::{jitter, ExponentialBackoff};

use crate::connection::Connection;
use crate::protocol::{command, RESP};
use crate::pubsub::{
    self, MessageHandler, SubscriptionChangeHandler, SubscriptionKind, SubscriptionRegistry,
};
use crate::rotator::AddressRotator;
use crate::types::{ClientError, FactoryConfig, PoolConfig, ResultT, RetryConfig};

const MAX_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Handle to a pool of Redis connections. All pool state lives in a single
/// actor task; handles submit requests to it, so the pool never needs a
/// lock around its bookkeeping. Cloning shares the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    requests: mpsc::UnboundedSender<PoolRequest>,
    lease_timeout: Duration,
}

enum PoolRequest {
    Activate,
    Lease {
        deadline: Instant,
        purpose: LeasePurpose,
    },
    Return {
        connection: Connection,
    },
    UpdateAddresses {
        addresses: Vec<SocketAddr>,
    },
    Close {
        done: oneshot::Sender<()>,
    },
    Subscribe {
        deadline: Instant,
        order: SubscribeOrder,
    },
    Unsubscribe {
        kind: SubscriptionKind,
        channels: Vec<String>,
        reply: oneshot::Sender<ResultT<()>>,
    },
    Created {
        result: ResultT<Connection>,
    },
    ReapExpired,
    PubSubDrained {
        receiver: mpsc::UnboundedReceiver<RESP>,
    },
    RemoteClosure {
        id: u64,
    },
    CloseFinished,
}

enum LeasePurpose {
    Caller(oneshot::Sender<ResultT<Connection>>),
    PinPubSub(SubscribeOrder),
}

impl LeasePurpose {
    fn fail(self, err: ClientError) {
        match self {
            LeasePurpose::Caller(reply) => {
                let _ = reply.send(Err(err));
            }
            LeasePurpose::PinPubSub(order) => {
                let _ = order.reply.send(Err(err));
            }
        }
    }
}

struct SubscribeOrder {
    kind: SubscriptionKind,
    channels: Vec<String>,
    on_message: MessageHandler,
    on_subscribe: Option<SubscriptionChangeHandler>,
    on_unsubscribe: Option<SubscriptionChangeHandler>,
    reply: oneshot::Sender<ResultT<()>>,
}

struct Waiter {
    deadline: Instant,
    purpose: LeasePurpose,
}

struct PubSubState {
    connection: Connection,
    registry: Arc<SubscriptionRegistry>,
    driver: JoinHandle<()>,
}

impl ConnectionPool {
    /// Creates the pool and spawns its actor on the current runtime. No
    /// connections are opened until [`activate`](Self::activate) or the
    /// first lease.
    pub fn new(config: PoolConfig) -> ConnectionPool {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let lease_timeout = config.retry.timeout;
        let rotator = AddressRotator::new(config.initial_addresses.clone());
        let actor = PoolActor {
            config,
            rotator,
            requests: requests_rx,
            self_sender: requests_tx.clone(),
            available: VecDeque::new(),
            leased: HashSet::new(),
            pending_creations: 0,
            waiters: VecDeque::new(),
            pubsub: None,
            activated: false,
            closed: false,
            closing: 0,
            close_waiters: Vec::new(),
        };
        tokio::spawn(actor.run());
        ConnectionPool {
            requests: requests_tx,
            lease_timeout,
        }
    }

    /// Starts maintaining the configured idle floor. Idempotent.
    pub fn activate(&self) {
        let _ = self.requests.send(PoolRequest::Activate);
    }

    pub async fn lease(&self) -> ResultT<Connection> {
        self.lease_by(Instant::now() + self.lease_timeout).await
    }

    pub async fn lease_by(&self, deadline: Instant) -> ResultT<Connection> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = PoolRequest::Lease {
            deadline,
            purpose: LeasePurpose::Caller(reply_tx),
        };
        if self.requests.send(request).is_err() {
            return Err(ClientError::PoolClosed);
        }
        match reply_rx.await {
            Ok(result) => result,
            Err(_) => Err(ClientError::PoolClosed),
        }
    }

    /// Hands a leased connection back. Each lease must be returned exactly
    /// once; dead connections are discarded and replaced on demand.
    pub fn return_connection(&self, connection: Connection) {
        let _ = self.requests.send(PoolRequest::Return { connection });
    }

    /// Runs `body` against one leased connection, guaranteeing every command
    /// issued inside lands on the same socket, and returns the connection
    /// when the body's future resolves.
    pub async fn lease_connection<F, Fut, T>(&self, body: F) -> ResultT<T>
    where
        F: FnOnce(Connection) -> Fut,
        Fut: Future<Output = ResultT<T>>,
    {
        let connection = self.lease().await?;
        let result = body(connection.clone()).await;
        self.return_connection(connection);
        result
    }

    /// Sends a single command on any pooled connection.
    pub async fn send(&self, name: &str, args: Vec<RESP>) -> ResultT<RESP> {
        let parts = command(name, args);
        self.lease_connection(move |connection| async move { connection.send(parts).await })
            .await
    }

    pub async fn subscribe(
        &self,
        channels: Vec<String>,
        on_message: MessageHandler,
        on_subscribe: Option<SubscriptionChangeHandler>,
        on_unsubscribe: Option<SubscriptionChangeHandler>,
    ) -> ResultT<()> {
        self.subscribe_kind(
            SubscriptionKind::Exact,
            channels,
            on_message,
            on_subscribe,
            on_unsubscribe,
        )
        .await
    }

    pub async fn psubscribe(
        &self,
        patterns: Vec<String>,
        on_message: MessageHandler,
        on_subscribe: Option<SubscriptionChangeHandler>,
        on_unsubscribe: Option<SubscriptionChangeHandler>,
    ) -> ResultT<()> {
        self.subscribe_kind(
            SubscriptionKind::Pattern,
            patterns,
            on_message,
            on_subscribe,
            on_unsubscribe,
        )
        .await
    }

    async fn subscribe_kind(
        &self,
        kind: SubscriptionKind,
        channels: Vec<String>,
        on_message: MessageHandler,
        on_subscribe: Option<SubscriptionChangeHandler>,
        on_unsubscribe: Option<SubscriptionChangeHandler>,
    ) -> ResultT<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = PoolRequest::Subscribe {
            deadline: Instant::now() + self.lease_timeout,
            order: SubscribeOrder {
                kind,
                channels,
                on_message,
                on_subscribe,
                on_unsubscribe,
                reply: reply_tx,
            },
        };
        if self.requests.send(request).is_err() {
            return Err(ClientError::PoolClosed);
        }
        match reply_rx.await {
            Ok(result) => result,
            Err(_) => Err(ClientError::PoolClosed),
        }
    }

    pub async fn unsubscribe(&self, channels: Vec<String>) -> ResultT<()> {
        self.unsubscribe_kind(SubscriptionKind::Exact, channels).await
    }

    pub async fn punsubscribe(&self, patterns: Vec<String>) -> ResultT<()> {
        self.unsubscribe_kind(SubscriptionKind::Pattern, patterns).await
    }

    async fn unsubscribe_kind(
        &self,
        kind: SubscriptionKind,
        channels: Vec<String>,
    ) -> ResultT<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = PoolRequest::Unsubscribe {
            kind,
            channels,
            reply: reply_tx,
        };
        if self.requests.send(request).is_err() {
            return Err(ClientError::PoolClosed);
        }
        match reply_rx.await {
            Ok(result) => result,
            Err(_) => Err(ClientError::PoolClosed),
        }
    }

    /// Replaces the target list used for future connection attempts.
    /// Existing connections are unaffected.
    pub fn update_connection_addresses(&self, addresses: Vec<SocketAddr>) {
        let _ = self
            .requests
            .send(PoolRequest::UpdateAddresses { addresses });
    }

    /// Closes the pool: pending and future leases fail, idle connections
    /// close now, leased connections close as they come back. Resolves once
    /// every connection has finished closing. Idempotent.
    pub async fn close(&self) -> ResultT<()> {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .requests
            .send(PoolRequest::Close { done: done_tx })
            .is_err()
        {
            return Ok(());
        }
        let _ = done_rx.await;
        Ok(())
    }
}

struct PoolActor {
    config: PoolConfig,
    rotator: AddressRotator,
    requests: mpsc::UnboundedReceiver<PoolRequest>,
    self_sender: mpsc::UnboundedSender<PoolRequest>,
    available: VecDeque<Connection>,
    leased: HashSet<u64>,
    pending_creations: usize,
    waiters: VecDeque<Waiter>,
    pubsub: Option<PubSubState>,
    activated: bool,
    closed: bool,
    closing: usize,
    close_waiters: Vec<oneshot::Sender<()>>,
}

impl PoolActor {
    async fn run(mut self) {
        while let Some(request) = self.requests.recv().await {
            self.dispatch(request);
            if self.finished_closing() {
                for done in self.close_waiters.drain(..) {
                    let _ = done.send(());
                }
                break;
            }
        }
        debug!("connection pool actor stopped");
    }

    fn dispatch(&mut self, request: PoolRequest) {
        match request {
            PoolRequest::Activate => {
                self.activated = true;
                self.maintain_minimum();
            }
            PoolRequest::Lease { deadline, purpose } => self.handle_lease(deadline, purpose),
            PoolRequest::Return { connection } => self.handle_return(connection),
            PoolRequest::UpdateAddresses { addresses } => {
                info!("updating pool targets to {} addresses", addresses.len());
                self.rotator.update(addresses);
            }
            PoolRequest::Close { done } => self.handle_close(done),
            PoolRequest::Subscribe { deadline, order } => self.handle_subscribe(deadline, order),
            PoolRequest::Unsubscribe {
                kind,
                channels,
                reply,
            } => self.handle_unsubscribe(kind, channels, reply),
            PoolRequest::Created { result } => self.handle_created(result),
            PoolRequest::ReapExpired => self.reap_expired_waiters(),
            PoolRequest::PubSubDrained { receiver } => self.handle_pubsub_drained(receiver),
            PoolRequest::RemoteClosure { id } => {
                self.available.retain(|c| c.id() != id);
                self.maintain_minimum();
            }
            PoolRequest::CloseFinished => {
                self.closing -= 1;
            }
        }
    }

    // In-flight creations are not waited on: once the actor stops, their
    // retry loops observe the closed channel and bail, and any socket a
    // late success opened closes when its last handle drops.
    fn finished_closing(&self) -> bool {
        self.closed
            && self.leased.is_empty()
            && self.closing == 0
            && self.pubsub.is_none()
    }

    fn total_connections(&self) -> usize {
        self.leased.len()
            + self.available.len()
            + self.pending_creations
            + self.pubsub.is_some() as usize
    }

    fn handle_lease(&mut self, deadline: Instant, purpose: LeasePurpose) {
        if self.closed {
            purpose.fail(ClientError::PoolClosed);
            return;
        }
        if let Some(connection) = self.pop_idle() {
            self.grant(connection, purpose);
            self.maintain_minimum();
            return;
        }
        let can_create = self.config.max_connections.is_leaky()
            || self.total_connections() < self.config.max_connections.cap();
        if can_create {
            if self.rotator.is_empty() {
                purpose.fail(ClientError::NoAvailableTargets);
                return;
            }
            self.spawn_creation(Some(deadline));
        }
        self.enqueue_waiter(deadline, purpose);
    }

    fn pop_idle(&mut self) -> Option<Connection> {
        while let Some(connection) = self.available.pop_back() {
            if connection.is_closed() {
                debug!("dropping dead idle connection {}", connection.id());
                continue;
            }
            return Some(connection);
        }
        None
    }

    fn grant(&mut self, connection: Connection, purpose: LeasePurpose) {
        match purpose {
            LeasePurpose::Caller(reply) => {
                let id = connection.id();
                self.leased.insert(id);
                if let Err(rejected) = reply.send(Ok(connection)) {
                    // the caller gave up; take the lease back
                    self.leased.remove(&id);
                    if let Ok(connection) = rejected {
                        self.park(connection);
                    }
                }
            }
            LeasePurpose::PinPubSub(order) => self.pin_and_subscribe(connection, order),
        }
    }

    /// Serve the oldest live waiter, or park the connection as idle.
    fn hand_off(&mut self, connection: Connection) {
        let mut connection = connection;
        let now = Instant::now();
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.deadline <= now {
                waiter.purpose.fail(ClientError::AcquireTimeout);
                continue;
            }
            match waiter.purpose {
                LeasePurpose::Caller(reply) => {
                    let id = connection.id();
                    self.leased.insert(id);
                    match reply.send(Ok(connection)) {
                        Ok(()) => return,
                        Err(rejected) => {
                            self.leased.remove(&id);
                            match rejected {
                                Ok(given_back) => connection = given_back,
                                Err(_) => return,
                            }
                        }
                    }
                }
                LeasePurpose::PinPubSub(order) => {
                    self.pin_and_subscribe(connection, order);
                    return;
                }
            }
        }
        self.park(connection);
    }

    fn park(&mut self, connection: Connection) {
        if self.closed {
            self.spawn_close(connection);
            return;
        }
        if self.available.len() >= self.config.max_connections.cap() {
            debug!(
                "closing surplus connection {} returned over the idle cap",
                connection.id()
            );
            self.spawn_close(connection);
            return;
        }
        self.available.push_back(connection);
    }

    fn handle_return(&mut self, connection: Connection) {
        let id = connection.id();
        if !self.leased.remove(&id) {
            debug_assert!(false, "connection {} returned but not leased", id);
            warn!("ignoring return of connection {} that is not leased", id);
            return;
        }
        if self.closed {
            self.spawn_close(connection);
            return;
        }
        if connection.is_closed() {
            debug!("discarding dead connection {} on return", id);
            self.maintain_minimum();
            return;
        }
        self.hand_off(connection);
    }

    fn handle_close(&mut self, done: oneshot::Sender<()>) {
        self.close_waiters.push(done);
        if self.closed {
            return;
        }
        self.closed = true;
        info!("closing connection pool");
        for waiter in self.waiters.drain(..) {
            waiter.purpose.fail(ClientError::PoolClosed);
        }
        while let Some(connection) = self.available.pop_front() {
            self.spawn_close(connection);
        }
        if let Some(state) = self.pubsub.take() {
            state.driver.abort();
            state.connection.set_allow_subscriptions(false);
            self.spawn_close(state.connection);
        }
    }

    fn handle_created(&mut self, result: ResultT<Connection>) {
        self.pending_creations -= 1;
        match result {
            Ok(connection) => {
                self.install_closure_hook(&connection);
                if self.closed {
                    self.spawn_close(connection);
                    return;
                }
                self.hand_off(connection);
                self.maintain_minimum();
            }
            Err(err) => {
                warn!("connection creation failed: {}", err);
                // an attempt that outlived its waiter's deadline reports
                // AcquireTimeout; the reaper already failed that lease
                if !matches!(err, ClientError::AcquireTimeout) {
                    if let Some(waiter) = self.waiters.pop_front() {
                        waiter.purpose.fail(err);
                    }
                }
                // a failed warm-up attempt must not leave the idle floor
                // unmet until unrelated traffic revisits it
                self.maintain_minimum();
            }
        }
    }

    fn handle_subscribe(&mut self, deadline: Instant, order: SubscribeOrder) {
        if self.closed {
            let _ = order.reply.send(Err(ClientError::PoolClosed));
            return;
        }
        if self.pubsub.is_some() {
            self.subscribe_on_pinned(order);
            return;
        }
        self.handle_lease(deadline, LeasePurpose::PinPubSub(order));
    }

    fn subscribe_on_pinned(&mut self, order: SubscribeOrder) {
        let state = self.pubsub.as_ref().expect("pinned connection present");
        state.registry.register(
            order.kind,
            &order.channels,
            order.on_message,
            order.on_subscribe,
            order.on_unsubscribe,
        );
        let connection = state.connection.clone();
        let parts = subscription_command(order.kind.subscribe_command(), &order.channels);
        let reply = order.reply;
        tokio::spawn(async move {
            let result = connection.send_subscription_change(parts).await;
            let _ = reply.send(result);
        });
    }

    fn pin_and_subscribe(&mut self, connection: Connection, order: SubscribeOrder) {
        if self.pubsub.is_some() {
            // raced another first-subscribe; keep the single pinned slot
            self.subscribe_on_pinned(order);
            self.hand_off(connection);
            return;
        }
        let receiver = match connection.take_push_receiver() {
            Some(receiver) => receiver,
            None => {
                let _ = order
                    .reply
                    .send(Err(ClientError::Protocol("push receiver unavailable".into())));
                self.park(connection);
                return;
            }
        };
        connection.set_allow_subscriptions(true);
        let registry = Arc::new(SubscriptionRegistry::default());
        registry.register(
            order.kind,
            &order.channels,
            order.on_message,
            order.on_subscribe,
            order.on_unsubscribe,
        );
        let sender = self.self_sender.clone();
        let driver_registry = registry.clone();
        let driver = tokio::spawn(async move {
            let receiver = pubsub::run_push_driver(receiver, driver_registry).await;
            let _ = sender.send(PoolRequest::PubSubDrained { receiver });
        });
        info!("pinned connection {} for pub/sub", connection.id());
        let parts = subscription_command(order.kind.subscribe_command(), &order.channels);
        let subscribing = connection.clone();
        let reply = order.reply;
        tokio::spawn(async move {
            let result = subscribing.send_subscription_change(parts).await;
            let _ = reply.send(result);
        });
        self.pubsub = Some(PubSubState {
            connection,
            registry,
            driver,
        });
    }

    fn handle_unsubscribe(
        &mut self,
        kind: SubscriptionKind,
        channels: Vec<String>,
        reply: oneshot::Sender<ResultT<()>>,
    ) {
        match &self.pubsub {
            Some(state) => {
                let connection = state.connection.clone();
                let parts = subscription_command(kind.unsubscribe_command(), &channels);
                tokio::spawn(async move {
                    let result = connection.send_subscription_change(parts).await;
                    let _ = reply.send(result);
                });
            }
            // nothing is pinned, so there is nothing to unsubscribe
            None => {
                let _ = reply.send(Ok(()));
            }
        }
    }

    fn handle_pubsub_drained(&mut self, receiver: mpsc::UnboundedReceiver<RESP>) {
        let state = match self.pubsub.take() {
            Some(state) => state,
            None => return,
        };
        state.connection.set_allow_subscriptions(false);
        state.connection.restore_push_receiver(receiver);
        info!("releasing pub/sub connection {}", state.connection.id());
        if self.closed {
            self.spawn_close(state.connection);
        } else if state.connection.is_closed() {
            self.maintain_minimum();
        } else {
            self.hand_off(state.connection);
        }
    }

    fn reap_expired_waiters(&mut self) {
        let now = Instant::now();
        let mut kept = VecDeque::with_capacity(self.waiters.len());
        for waiter in self.waiters.drain(..) {
            if waiter.deadline <= now {
                waiter.purpose.fail(ClientError::AcquireTimeout);
            } else {
                kept.push_back(waiter);
            }
        }
        self.waiters = kept;
    }

    fn enqueue_waiter(&mut self, deadline: Instant, purpose: LeasePurpose) {
        self.waiters.push_back(Waiter { deadline, purpose });
        let sender = self.self_sender.clone();
        tokio::spawn(async move {
            sleep_until(deadline).await;
            let _ = sender.send(PoolRequest::ReapExpired);
        });
    }

    fn maintain_minimum(&mut self) {
        if self.closed || !self.activated || self.rotator.is_empty() {
            return;
        }
        while self.available.len() + self.pending_creations < self.config.minimum_connections
            && self.total_connections() < self.config.max_connections.cap()
        {
            self.spawn_creation(None);
        }
    }

    fn spawn_creation(&mut self, deadline: Option<Instant>) {
        // each creation walks its own copy of the rotation; the pool's
        // rotator advances one step so concurrent creations start on
        // different targets
        let targets = self.rotator.clone();
        self.rotator.next_target();
        self.pending_creations += 1;
        let factory = self.config.factory.clone();
        let retry = self.config.retry.clone();
        let sender = self.self_sender.clone();
        tokio::spawn(async move {
            let result = create_with_backoff(targets, factory, retry, deadline, &sender).await;
            let _ = sender.send(PoolRequest::Created { result });
        });
    }

    fn spawn_close(&mut self, connection: Connection) {
        self.closing += 1;
        let sender = self.self_sender.clone();
        tokio::spawn(async move {
            let _ = connection.close().await;
            let _ = sender.send(PoolRequest::CloseFinished);
        });
    }

    fn install_closure_hook(&self, connection: &Connection) {
        let id = connection.id();
        let sender = self.self_sender.clone();
        let user_handler = self.config.on_unexpected_closure.clone();
        connection.set_on_unexpected_closure(move || {
            if let Some(handler) = user_handler {
                handler();
            }
            let _ = sender.send(PoolRequest::RemoteClosure { id });
        });
    }
}

fn subscription_command(name: &str, channels: &[String]) -> Vec<RESP> {
    let args = channels.iter().map(|c| RESP::bulk(c.clone())).collect();
    command(name, args)
}

/// Walks round-robin targets with jittered exponential backoff between
/// attempts until one connects. A lease-driven creation stops at its
/// deadline with `AcquireTimeout`; warm-up creations (`deadline: None`)
/// keep retrying, with the delay capped, until the pool goes away. An
/// empty rotation fails with `NoAvailableTargets`.
async fn create_with_backoff(
    mut targets: AddressRotator,
    factory: FactoryConfig,
    retry: RetryConfig,
    deadline: Option<Instant>,
    pool: &mpsc::UnboundedSender<PoolRequest>,
) -> ResultT<Connection> {
    let mut delays = ExponentialBackoff::from_millis(u64::from(retry.factor))
        .factor(retry.initial_delay.as_millis() as u64)
        .max_delay(MAX_RETRY_DELAY)
        .map(jitter);
    let mut attempt = 0usize;
    loop {
        if pool.is_closed() {
            return Err(ClientError::PoolClosed);
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return Err(ClientError::AcquireTimeout);
            }
        }
        let address = match targets.next_target() {
            Some(address) => address,
            None => return Err(ClientError::NoAvailableTargets),
        };
        match Connection::connect(address, &factory).await {
            Ok(connection) => return Ok(connection),
            Err(err) => {
                warn!(
                    "connection attempt {} to {} failed: {}",
                    attempt, address, err
                );
                attempt += 1;
                if let Some(delay) = delays.next() {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
