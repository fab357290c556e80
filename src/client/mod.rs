//! The client handle: the object a process (or a broker acting as a
//! bridge) uses to talk to one broker.

mod channel;

pub use channel::{Channel, ChannelEvent, Reply};

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use futures::future::BoxFuture;
use hashbrown::HashMap;
use tokio::{
    net::{TcpStream, UdpSocket},
    sync::{watch, Mutex, RwLock},
    task::JoinHandle,
};
use tracing::{debug, debug_span, warn, Instrument};
use typed_builder::TypedBuilder;

use crate::backoff::BackoffPolicy;
use crate::error::{Error, Result};
use crate::proto::{
    encode_frame, ConnectReply, ConnectRequest, Frame, GetRequest, Message,
    RequestCode, WireReader, WireWriter, PROTOCOL_VERSION,
};

/// Invoked on the dispatch task for every matching message of a standing
/// subscription.
pub type SubscriptionCallback = Arc<dyn Fn(Message) + Send + Sync + 'static>;

/// Where the handle currently stands in its failover state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

/// How long an outward call polls for a background reconnect to finish
/// before re-raising its error, and at what interval.
const FAILOVER_POLL: Duration = Duration::from_millis(100);
const FAILOVER_BUDGET: Duration = Duration::from_secs(3);

#[derive(Clone, TypedBuilder)]
pub struct ClientConfig {
    /// Semicolon-separated list of `host:port` broker URLs, tried in
    /// order on connect and on failover.
    #[builder(setter(into))]
    pub urls: String,
    #[builder(setter(into))]
    pub name: String,
    #[builder(default = String::from("/default"), setter(into))]
    pub namespace: String,
    #[builder(default, setter(into))]
    pub password: String,
    #[builder(default = Duration::from_millis(1000))]
    pub keepalive: Duration,
    /// Deadline for simple request/ack exchanges (connect, subscribe,
    /// syncSend). Get-style calls carry their own caller-supplied one.
    #[builder(default = Duration::from_secs(3))]
    pub ack_timeout: Duration,
    #[builder(default)]
    pub backoff: BackoffPolicy,
}

struct SubEntry {
    subject: String,
    kind: String,
    callback: SubscriptionCallback,
}

struct Active {
    channel: Arc<Channel>,
    token: u64,
    url: String,
    udp: Option<Arc<UdpSocket>>,
    tasks: Vec<JoinHandle<()>>,
}

struct Shared {
    config: ClientConfig,
    /// Exclusive for connect/disconnect/failover, shared for every other
    /// call. This is the outermost lock of the handle.
    conn: RwLock<Option<Active>>,
    /// Serializes calls that wait on a broker reply (syncSend, lock
    /// grants) against each other, independent of send-only traffic.
    sync_lock: Mutex<()>,
    /// Serializes subscribe/unsubscribe so broker-side ordering matches
    /// call order. Never held across send/sendAndGet.
    sub_lock: Mutex<()>,
    subs: Mutex<HashMap<u64, SubEntry>>,
    sub_ids: AtomicU64,
    state_tx: watch::Sender<ConnectionState>,
    reconnecting: AtomicBool,
}

/// A handle to one broker, with reconnect/failover across a URL list.
///
/// Cloning is cheap and hands out another handle to the same connection.
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                config,
                conn: RwLock::new(None),
                sync_lock: Mutex::new(()),
                sub_lock: Mutex::new(()),
                subs: Mutex::new(HashMap::new()),
                sub_ids: AtomicU64::new(1),
                state_tx,
                reconnecting: AtomicBool::new(false),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    fn urls(&self) -> Vec<String> {
        self.shared
            .config
            .urls
            .split(';')
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(String::from)
            .collect()
    }

    /// Connects to the first reachable broker in the URL list. A failure
    /// on one URL advances to the next; exhausting the list is
    /// `ConnectFailed`.
    pub async fn connect(&self) -> Result<()> {
        let mut conn = self.shared.conn.write().await;
        if conn.is_some() {
            return Ok(());
        }
        self.shared.state_tx.send_replace(ConnectionState::Connecting);
        let urls = self.urls();
        if urls.is_empty() {
            self.shared.state_tx.send_replace(ConnectionState::Failed);
            return Err(Error::ConnectFailed("no URLs configured".into()));
        }
        let mut failures = 0usize;
        for url in &urls {
            match self.dial(url).await {
                Ok(active) => {
                    *conn = Some(active);
                    self.shared
                        .state_tx
                        .send_replace(ConnectionState::Connected);
                    return Ok(());
                }
                Err(e) => {
                    failures += 1;
                    debug!("connect to {url} failed: {e}");
                }
            }
        }
        self.shared.state_tx.send_replace(ConnectionState::Failed);
        Err(Error::ConnectFailed(format!(
            "all {failures} broker URLs refused"
        )))
    }

    /// One TCP connect + registration handshake against a single URL,
    /// including spawning the dispatch and keep-alive tasks.
    async fn dial(&self, url: &str) -> Result<Active> {
        let span = debug_span!("dial", broker = %url);
        async {
            let stream = TcpStream::connect(url).await?;
            stream.set_nodelay(true)?;
            let peer_ip = stream.peer_addr()?.ip();
            let (channel, events) = Channel::open(stream);

            let corr = channel.next_corr();
            let req = ConnectRequest {
                corr,
                version: PROTOCOL_VERSION,
                password: self.shared.config.password.clone(),
                name: self.shared.config.name.clone(),
                namespace: self.shared.config.namespace.clone(),
                host: hostname(),
                server_url: String::new(),
                keepalive_ms: self.shared.config.keepalive.as_millis() as u32,
            };
            let reply = channel
                .call(
                    RequestCode::ClientConnect,
                    corr,
                    req.encode(),
                    self.shared.config.ack_timeout,
                )
                .await?;
            let body = reply.ok()?;
            let ack = ConnectReply::decode(&mut WireReader::new(&body))?;
            debug!(token = ack.token, "registered with broker");

            let udp = if ack.udp_port != 0 {
                let socket = UdpSocket::bind("0.0.0.0:0").await?;
                socket.connect((peer_ip, ack.udp_port as u16)).await?;
                Some(Arc::new(socket))
            } else {
                None
            };

            let dispatch = tokio::spawn(
                dispatch_loop(self.clone(), events)
                    .instrument(debug_span!("dispatch", broker = %url)),
            );
            let keepalive = tokio::spawn(
                keepalive_loop(self.clone(), channel.clone())
                    .instrument(debug_span!("keepalive", broker = %url)),
            );

            Ok(Active {
                channel,
                token: ack.token,
                url: url.to_string(),
                udp,
                tasks: vec![dispatch, keepalive],
            })
        }
        .instrument(span)
        .await
    }

    /// Disconnects and discards all subscriptions. Every outstanding get
    /// on the old connection is woken by the channel teardown.
    pub async fn disconnect(&self) {
        let mut conn = self.shared.conn.write().await;
        if let Some(active) = conn.take() {
            let _ = active
                .channel
                .notify(RequestCode::ClientDisconnect, Vec::new())
                .await;
            teardown(active).await;
        }
        self.shared.subs.lock().await.clear();
        self.shared.state_tx.send_replace(ConnectionState::Disconnected);
    }

    async fn channel(&self) -> Result<Arc<Channel>> {
        let conn = self.shared.conn.read().await;
        match conn.as_ref() {
            Some(active) if active.channel.is_alive() => {
                Ok(active.channel.clone())
            }
            _ => Err(Error::ConnectionLost),
        }
    }

    /// Fire-and-forget publish. Reliable messages travel over TCP; an
    /// unreliable one goes out as a single UDP datagram if the broker
    /// offered a UDP port.
    pub async fn send(&self, mut msg: Message) -> Result<()> {
        self.stamp(&mut msg).await?;
        match self.send_once(&msg).await {
            Ok(()) => Ok(()),
            Err(e @ (Error::ConnectionLost | Error::Io(_)))
                if self.urls().len() > 1 =>
            {
                // a background reconnect may be in flight; wait for it
                // and retry once before surfacing anything
                if self.await_failover().await {
                    self.send_once(&msg).await
                } else {
                    Err(e)
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn send_once(&self, msg: &Message) -> Result<()> {
        let conn = self.shared.conn.read().await;
        let active = conn.as_ref().ok_or(Error::ConnectionLost)?;
        if !msg.reliable {
            if let Some(udp) = &active.udp {
                let frame = Frame::new(RequestCode::Send, msg.encode());
                udp.send(&encode_frame(&frame)).await?;
                return Ok(());
            }
        }
        active.channel.notify(RequestCode::Send, msg.encode()).await
    }

    /// Publish and wait for the broker's integer acknowledgement.
    pub async fn sync_send(&self, mut msg: Message) -> Result<i32> {
        self.stamp(&mut msg).await?;
        let _sync = self.shared.sync_lock.lock().await;
        let channel = self.channel().await?;
        let corr = channel.next_corr();
        let mut w = WireWriter::new();
        w.put_u64(corr);
        let mut body = w.finish();
        body.extend_from_slice(&msg.encode());
        let reply = channel
            .call(
                RequestCode::SyncSend,
                corr,
                body,
                self.shared.config.ack_timeout,
            )
            .await?;
        let body = reply.ok()?;
        WireReader::new(&body).i32()
    }

    /// Registers a callback for every message matching the
    /// subject/type pattern pair. Re-registering the identical
    /// `(subject, type, callback)` tuple is `AlreadyExists`.
    pub async fn subscribe(
        &self,
        subject: &str,
        kind: &str,
        callback: SubscriptionCallback,
    ) -> Result<u64> {
        let _ordering = self.shared.sub_lock.lock().await;
        {
            let subs = self.shared.subs.lock().await;
            let dup = subs.values().any(|s| {
                s.subject == subject
                    && s.kind == kind
                    && Arc::ptr_eq(&s.callback, &callback)
            });
            if dup {
                return Err(Error::AlreadyExists(format!(
                    "subscription to ({subject}, {kind})"
                )));
            }
        }
        let channel = self.channel().await?;
        let sub_id = self.shared.sub_ids.fetch_add(1, Ordering::Relaxed);
        let corr = channel.next_corr();
        let req = GetRequest {
            corr,
            id: sub_id,
            subject: subject.into(),
            kind: kind.into(),
            namespace: self.shared.config.namespace.clone(),
        };
        channel
            .call(
                RequestCode::Subscribe,
                corr,
                req.encode(),
                self.shared.config.ack_timeout,
            )
            .await?
            .ok()?;
        self.shared.subs.lock().await.insert(
            sub_id,
            SubEntry {
                subject: subject.into(),
                kind: kind.into(),
                callback,
            },
        );
        Ok(sub_id)
    }

    pub async fn unsubscribe(&self, sub_id: u64) -> Result<()> {
        let _ordering = self.shared.sub_lock.lock().await;
        let entry = self
            .shared
            .subs
            .lock()
            .await
            .remove(&sub_id)
            .ok_or_else(|| {
                Error::Protocol(format!("unknown subscription id {sub_id}"))
            })?;
        let channel = self.channel().await?;
        let corr = channel.next_corr();
        let req = GetRequest {
            corr,
            id: sub_id,
            subject: entry.subject,
            kind: entry.kind,
            namespace: self.shared.config.namespace.clone(),
        };
        channel
            .call(
                RequestCode::Unsubscribe,
                corr,
                req.encode(),
                self.shared.config.ack_timeout,
            )
            .await?
            .ok()?;
        Ok(())
    }

    /// One-shot subscribe: resolves with the first message matching the
    /// pattern pair, or `Timeout`. Never leaves broker-side state behind:
    /// a timeout sends a best-effort "forget this id" upstream.
    pub async fn subscribe_and_get(
        &self,
        subject: &str,
        kind: &str,
        timeout: Duration,
    ) -> Result<Message> {
        let channel = self.channel().await?;
        let corr = channel.next_corr();
        let req = GetRequest {
            corr,
            id: corr,
            subject: subject.into(),
            kind: kind.into(),
            namespace: self.shared.config.namespace.clone(),
        };
        let outcome = channel
            .call(RequestCode::SubscribeAndGet, corr, req.encode(), timeout)
            .await;
        self.finish_get(
            channel,
            corr,
            outcome,
            RequestCode::UnsubscribeAndGet,
        )
        .await
    }

    /// Publish-then-wait: the message is marked as a get request and the
    /// call resolves with the first response any consumer (on any broker
    /// in the cloud) produces for it.
    pub async fn send_and_get(
        &self,
        mut msg: Message,
        timeout: Duration,
    ) -> Result<Message> {
        self.stamp(&mut msg).await?;
        let channel = self.channel().await?;
        let corr = channel.next_corr();
        msg.is_get_request = true;
        msg.sender_id = corr;
        let mut w = WireWriter::new();
        w.put_u64(corr);
        let mut body = w.finish();
        body.extend_from_slice(&msg.encode());
        let outcome = channel
            .call(RequestCode::SendAndGet, corr, body, timeout)
            .await;
        self.finish_get(channel, corr, outcome, RequestCode::UnSendAndGet)
            .await
    }

    /// Shared tail of the two get-style calls: map the outcome to exactly
    /// one of result / `Timeout` / `ServerDied`, cleaning up upstream
    /// state on timeout.
    async fn finish_get(
        &self,
        channel: Arc<Channel>,
        id: u64,
        outcome: Result<Reply>,
        forget: RequestCode,
    ) -> Result<Message> {
        match outcome {
            Ok(reply) => {
                let body = reply.ok().map_err(|e| match e {
                    Error::ConnectionLost => Error::ServerDied,
                    other => other,
                })?;
                Message::decode(&mut WireReader::new(&body))
            }
            Err(Error::Timeout) => {
                // local state is already unregistered; failure to deliver
                // the forget message upstream is ignored
                let mut w = WireWriter::new();
                w.put_u64(id);
                let _ = channel.notify(forget, w.finish()).await;
                Err(Error::Timeout)
            }
            Err(Error::ConnectionLost) => Err(Error::ServerDied),
            Err(e) => Err(e),
        }
    }

    /// Asks the broker to shut down every connected client whose name
    /// matches the `*`/`?` pattern.
    pub async fn shutdown_clients(
        &self,
        pattern: &str,
        include_self: bool,
    ) -> Result<()> {
        self.shutdown(RequestCode::ShutdownClients, pattern, include_self)
            .await
    }

    /// Asks the broker to shut down every cloud peer whose name matches.
    pub async fn shutdown_servers(
        &self,
        pattern: &str,
        include_self: bool,
    ) -> Result<()> {
        self.shutdown(RequestCode::ShutdownServers, pattern, include_self)
            .await
    }

    async fn shutdown(
        &self,
        code: RequestCode,
        pattern: &str,
        include_self: bool,
    ) -> Result<()> {
        let _sync = self.shared.sync_lock.lock().await;
        let channel = self.channel().await?;
        let corr = channel.next_corr();
        let mut w = WireWriter::new();
        w.put_u64(corr).put_str(pattern).put_u8(include_self as u8);
        channel
            .call(code, corr, w.finish(), self.shared.config.ack_timeout)
            .await?
            .ok()?;
        Ok(())
    }

    /// Fills in the sender fields every outbound message carries.
    async fn stamp(&self, msg: &mut Message) -> Result<()> {
        let conn = self.shared.conn.read().await;
        let active = conn.as_ref().ok_or(Error::ConnectionLost)?;
        msg.sender = self.shared.config.name.clone();
        msg.sender_host = hostname();
        msg.namespace = self.shared.config.namespace.clone();
        // a get response keeps the requester's routing stamps intact
        if !msg.is_get_response {
            msg.sender_token = active.token;
        }
        Ok(())
    }

    /// Polls for the keep-alive task to complete a reconnect cycle.
    /// Returns true once connected again.
    async fn await_failover(&self) -> bool {
        let deadline = tokio::time::Instant::now() + FAILOVER_BUDGET;
        loop {
            if self.state() == ConnectionState::Connected {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(FAILOVER_POLL).await;
        }
    }

    /// Drives reconnection after the connection died. With a single
    /// viable URL the handle tears itself down instead.
    ///
    /// Boxed because the future is recursive: failover dials, and a
    /// dial spawns the loops that call back into failover.
    fn handle_death(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.run_failover())
    }

    async fn run_failover(&self) {
        if self.shared.reconnecting.swap(true, Ordering::AcqRel) {
            return;
        }
        let urls = self.urls();
        let span = debug_span!("failover");
        async {
            // tear the dead connection out first so calls fail fast
            let old = self.shared.conn.write().await.take();
            if let Some(active) = old {
                teardown(active).await;
            }

            if urls.len() <= 1 {
                debug!("no failover URLs remain, tearing down");
                self.shared.subs.lock().await.clear();
                self.shared.state_tx.send_replace(ConnectionState::Failed);
                self.shared.reconnecting.store(false, Ordering::Release);
                return;
            }
            self.shared
                .state_tx
                .send_replace(ConnectionState::Reconnecting);

            let mut attempt = 0u32;
            loop {
                for url in &urls {
                    match self.dial(url).await {
                        Ok(active) => {
                            // standing subscriptions move with us;
                            // in-flight gets died with the old socket
                            if self.resubscribe(&active).await.is_err() {
                                warn!(
                                    "resubscribe on {url} failed, advancing"
                                );
                                teardown(active).await;
                                continue;
                            }
                            *self.shared.conn.write().await = Some(active);
                            self.shared
                                .state_tx
                                .send_replace(ConnectionState::Connected);
                            self.shared
                                .reconnecting
                                .store(false, Ordering::Release);
                            debug!("failover to {url} complete");
                            return;
                        }
                        Err(e) => debug!("failover to {url} failed: {e}"),
                    }
                }
                match self.shared.config.backoff.delay(attempt) {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => break,
                }
                attempt += 1;
            }
            warn!("failover exhausted, handle is dead");
            self.shared.subs.lock().await.clear();
            self.shared.state_tx.send_replace(ConnectionState::Failed);
            self.shared.reconnecting.store(false, Ordering::Release);
        }
        .instrument(span)
        .await
    }

    /// Re-issues every standing subscription on a fresh connection.
    /// One-shot gets are not resumed; they cannot be meaningfully
    /// replayed.
    async fn resubscribe(&self, active: &Active) -> Result<()> {
        let _ordering = self.shared.sub_lock.lock().await;
        let subs = self.shared.subs.lock().await;
        for (sub_id, entry) in subs.iter() {
            let corr = active.channel.next_corr();
            let req = GetRequest {
                corr,
                id: *sub_id,
                subject: entry.subject.clone(),
                kind: entry.kind.clone(),
                namespace: self.shared.config.namespace.clone(),
            };
            active
                .channel
                .call(
                    RequestCode::Subscribe,
                    corr,
                    req.encode(),
                    self.shared.config.ack_timeout,
                )
                .await?
                .ok()?;
        }
        Ok(())
    }
}

async fn teardown(active: Active) {
    active.channel.close().await;
    for task in active.tasks {
        task.abort();
    }
}

/// Consumes uncorrelated channel events: subscription deliveries, the
/// shutdown notice, and connection death.
async fn dispatch_loop(
    client: Client,
    mut events: tokio::sync::mpsc::UnboundedReceiver<ChannelEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::Delivery { sub_id, msg } => {
                let callback = {
                    let subs = client.shared.subs.lock().await;
                    subs.get(&sub_id).map(|s| s.callback.clone())
                };
                match callback {
                    Some(cb) => cb(msg),
                    None => debug!(
                        "delivery for unknown subscription {sub_id}, dropped"
                    ),
                }
            }
            ChannelEvent::ShutdownNotice => {
                debug!("broker ordered shutdown");
                // disconnect aborts this very task, so run it elsewhere
                let client = client.clone();
                tokio::spawn(async move { client.disconnect().await });
                return;
            }
            ChannelEvent::Dead => {
                let client = client.clone();
                tokio::spawn(async move { client.handle_death().await });
                return;
            }
        }
    }
}

/// Pings the broker at the agreed interval; a missed ack marks the
/// connection dead and starts failover.
async fn keepalive_loop(client: Client, channel: Arc<Channel>) {
    let interval = client.shared.config.keepalive;
    loop {
        tokio::time::sleep(interval).await;
        if !channel.is_alive() {
            return;
        }
        let corr = channel.next_corr();
        let mut w = WireWriter::new();
        w.put_u64(corr);
        let outcome = channel
            .call(RequestCode::KeepAlive, corr, w.finish(), interval * 2)
            .await;
        if let Err(e) = outcome {
            debug!("keep-alive failed: {e}");
            channel.close().await;
            // failover tears down the task running this loop
            tokio::spawn(async move { client.handle_death().await });
            return;
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| String::from("localhost"))
}
