//! The broker: accepts client and peer connections, runs the per-client
//! request pipeline, and federates with other brokers into a cloud.

mod bridge;
mod cloud;
mod pipeline;
mod subdomain;
mod subscriptions;

pub use bridge::{Bridge, BridgeIdentity};
pub use cloud::DistributedLock;
pub use subdomain::{
    Capabilities, LocalDelivery, MessagingSubdomain, SubdomainHandler,
};
pub use subscriptions::{Engine, Notifier, SubKey};

use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use hashbrown::{HashMap, HashSet};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, debug_span, info, warn, Instrument};
use typed_builder::TypedBuilder;

use crate::backoff::BackoffPolicy;
use crate::error::Result;
use crate::proto::{
    decode_datagram, CloudStatus, Frame, FrameWriter, Message, RequestCode,
};

#[derive(Clone, TypedBuilder)]
pub struct BrokerConfig {
    /// TCP listen address. Port 0 binds an ephemeral port.
    #[builder(default = String::from("0.0.0.0:45000"), setter(into))]
    pub addr: String,
    /// URL other brokers should dial to reach this one. Defaults to the
    /// actually bound address, which only works when that is routable.
    #[builder(default, setter(into))]
    pub advertised_url: String,
    #[builder(default, setter(into))]
    pub password: String,
    /// Semicolon-separated seed URLs of an existing cloud to join. Empty
    /// means this broker starts as its own one-member cloud.
    #[builder(default, setter(into))]
    pub cloud_seeds: String,
    #[builder(default = Duration::from_secs(3))]
    pub ack_timeout: Duration,
    /// How long a peer's lock request may wait before it is refused.
    #[builder(default = Duration::from_secs(3))]
    pub lock_timeout: Duration,
    #[builder(default)]
    pub backoff: BackoffPolicy,
    /// Bound of each per-client request queue.
    #[builder(default = 256)]
    pub queue_depth: usize,
    /// Permanent workers draining a client's normal queue. Ignored when
    /// `time_ordered` forces a single worker.
    #[builder(default = 3)]
    pub workers: usize,
    /// Deliver each client's messages strictly in arrival order, at the
    /// cost of all request parallelism for that client.
    #[builder(default = false)]
    pub time_ordered: bool,
    /// Offer a UDP port for unreliable sends.
    #[builder(default = true)]
    pub udp: bool,
}

/// One registered connection, ordinary client or peer broker. Frames for
/// it go through `outbound`; a dedicated writer task owns the socket's
/// write half, so concurrent deliveries never interleave on the wire.
pub struct ClientRecord {
    pub token: u64,
    pub name: String,
    pub namespace: String,
    pub is_server: bool,
    /// The peer's own listen URL when `is_server`, empty otherwise.
    pub server_url: String,
    pub keepalive_ms: u32,
    outbound: mpsc::Sender<Frame>,
    pub last_seen: AtomicI64,
    pub dead: AtomicBool,
    pub received: AtomicU64,
    pub delivered: AtomicU64,
    /// Member-lock holder strings this connection was last granted, so
    /// teardown can release a grant the peer died holding.
    pub cloud_holder: Mutex<Option<String>>,
    pub reg_holder: Mutex<Option<String>>,
}

impl ClientRecord {
    pub(crate) fn new(
        token: u64,
        name: String,
        namespace: String,
        is_server: bool,
        server_url: String,
        keepalive_ms: u32,
        outbound: mpsc::Sender<Frame>,
    ) -> Self {
        Self {
            token,
            name,
            namespace,
            is_server,
            server_url,
            keepalive_ms,
            outbound,
            last_seen: AtomicI64::new(chrono::Utc::now().timestamp_micros()),
            dead: AtomicBool::new(false),
            received: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            cloud_holder: Mutex::new(None),
            reg_holder: Mutex::new(None),
        }
    }

    /// Queues a frame for the writer task. False once the connection is
    /// gone; the caller treats that as a dead client, not an error.
    pub async fn deliver(&self, frame: Frame) -> bool {
        if self.dead.load(Ordering::Acquire) {
            return false;
        }
        let ok = self.outbound.send(frame).await.is_ok();
        if ok {
            self.delivered.fetch_add(1, Ordering::Relaxed);
        }
        ok
    }

    pub fn touch(&self) {
        self.last_seen
            .store(chrono::Utc::now().timestamp_micros(), Ordering::Relaxed);
    }
}

/// Everything the accept loop, pipelines and cloud machinery share.
pub struct BrokerShared {
    pub config: BrokerConfig,
    /// This broker's identity in the cloud: its advertised `host:port`.
    pub url: String,
    pub udp_port: u16,
    pub status: RwLock<CloudStatus>,
    /// Closed (false) while joining a cloud; ordinary registrations wait
    /// on it. Peer brokers are exempt.
    pub gate: watch::Sender<bool>,
    pub clients: RwLock<HashMap<u64, Arc<ClientRecord>>>,
    pub engine: Arc<Engine>,
    pub handler: Arc<dyn SubdomainHandler>,
    pub cloud_lock: DistributedLock,
    pub reg_lock: DistributedLock,
    tokens: AtomicU64,
    /// Peer URLs with a bridge dial in flight, so concurrent reciprocal
    /// connects collapse into one.
    pub connecting: Mutex<HashSet<String>>,
    pub shutdown: watch::Sender<bool>,
}

impl BrokerShared {
    pub fn next_token(&self) -> u64 {
        self.tokens.fetch_add(1, Ordering::Relaxed)
    }

    pub fn identity(&self) -> BridgeIdentity {
        BridgeIdentity {
            name: self.url.clone(),
            url: self.url.clone(),
            password: self.config.password.clone(),
            keepalive_ms: 1000,
        }
    }

    pub async fn client_names(&self) -> Vec<String> {
        self.clients
            .read()
            .await
            .values()
            .filter(|r| !r.is_server)
            .map(|r| r.name.clone())
            .collect()
    }

    /// Full teardown of one connection. Idempotent: the reader exit path
    /// and an explicit disconnect can both land here.
    pub async fn cleanup_client(&self, record: &Arc<ClientRecord>) {
        if record.dead.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(name = %record.name, token = record.token, "client cleanup");
        self.clients.write().await.remove(&record.token);
        self.engine.remove_client(record).await;
        // locks die with the connection that was granted them
        if let Some(holder) = record.cloud_holder.lock().await.take() {
            self.cloud_lock.release(&holder).await;
        }
        if let Some(holder) = record.reg_holder.lock().await.take() {
            self.reg_lock.release(&holder).await;
        }
        if record.is_server && !record.server_url.is_empty() {
            if let Some(bridge) =
                self.engine.remove_bridge(&record.server_url).await
            {
                bridge.close().await;
            }
        }
    }

    /// Orderly self-shutdown: warn ordinary clients, drop bridges, and
    /// stop the accept and pipeline tasks.
    pub async fn initiate_shutdown(&self) {
        info!(url = %self.url, "broker shutting down");
        let clients: Vec<_> =
            self.clients.read().await.values().cloned().collect();
        for record in clients {
            if !record.is_server {
                record
                    .deliver(Frame::new(
                        RequestCode::ShutdownNotice,
                        Vec::new(),
                    ))
                    .await;
            }
        }
        for bridge in self.engine.bridges().await {
            self.engine.remove_bridge(bridge.peer_name()).await;
            bridge.close().await;
        }
        // give the writer tasks a beat to flush the notices before the
        // pipelines tear the connections down
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = self.shutdown.send(true);
    }

    /// Immediate stop with no notice to anyone, as a crash would look.
    pub fn halt(&self) {
        let _ = self.shutdown.send(true);
    }
}

pub struct Broker {
    shared: Arc<BrokerShared>,
    local_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl Broker {
    /// Binds the listeners, then spawns the accept loop, the UDP intake
    /// and (when seeds are configured) the cloud-joining task.
    pub async fn start(config: BrokerConfig) -> Result<Broker> {
        let listener = TcpListener::bind(&config.addr).await?;
        let local_addr = listener.local_addr()?;
        let udp = if config.udp {
            Some(UdpSocket::bind((local_addr.ip(), 0)).await?)
        } else {
            None
        };
        let udp_port =
            udp.as_ref().and_then(|s| s.local_addr().ok()).map_or(0, |a| {
                a.port()
            });

        let url = if config.advertised_url.is_empty() {
            local_addr.to_string()
        } else {
            config.advertised_url.clone()
        };
        let seeds: Vec<String> = config
            .cloud_seeds
            .split(';')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        // with no cloud to join this broker is its own one-member cloud
        // and accepts clients immediately
        let standalone = seeds.is_empty();
        let (gate, _) = watch::channel(standalone);
        let (shutdown, _) = watch::channel(false);
        let engine = Engine::new();
        let handler: Arc<dyn SubdomainHandler> = Arc::new(
            MessagingSubdomain::new(LocalDelivery::new(engine.clone())),
        );

        let shared = Arc::new(BrokerShared {
            config,
            url: url.clone(),
            udp_port,
            status: RwLock::new(if standalone {
                CloudStatus::InCloud
            } else {
                CloudStatus::NonCloud
            }),
            gate,
            clients: RwLock::new(HashMap::new()),
            engine,
            handler,
            cloud_lock: DistributedLock::new(),
            reg_lock: DistributedLock::new(),
            tokens: AtomicU64::new(1),
            connecting: Mutex::new(HashSet::new()),
            shutdown,
        });

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(
            accept_loop(shared.clone(), listener)
                .instrument(debug_span!("accept", url = %url)),
        ));
        if let Some(socket) = udp {
            tasks.push(tokio::spawn(
                udp_loop(shared.clone(), socket)
                    .instrument(debug_span!("udp", url = %url)),
            ));
        }
        if !standalone {
            tasks.push(tokio::spawn(
                cloud::join_cloud(shared.clone(), seeds)
                    .instrument(debug_span!("join", url = %url)),
            ));
        }
        info!(%url, udp_port, "broker listening");
        Ok(Broker { shared, local_addr, tasks })
    }

    pub fn addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn url(&self) -> String {
        self.shared.url.clone()
    }

    pub async fn cloud_status(&self) -> CloudStatus {
        *self.shared.status.read().await
    }

    /// Ordinary clients currently registered.
    pub async fn client_count(&self) -> usize {
        self.shared
            .clients
            .read()
            .await
            .values()
            .filter(|r| !r.is_server)
            .count()
    }

    pub async fn bridge_count(&self) -> usize {
        self.shared.engine.bridges().await.len()
    }

    pub async fn subscription_count(&self) -> usize {
        self.shared.engine.subscription_count().await
    }

    pub async fn pending_get_count(&self) -> usize {
        self.shared.engine.pending_get_count().await
    }

    pub async fn shutdown(self) {
        self.shared.initiate_shutdown().await;
        for task in &self.tasks {
            task.abort();
        }
    }

    /// Simulates a crash: every socket drops mid-stream without any
    /// shutdown notice.
    pub fn kill(self) {
        self.shared.halt();
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn accept_loop(shared: Arc<BrokerShared>, listener: TcpListener) {
    let mut stopping = shared.shutdown.subscribe();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let shared = shared.clone();
                        tokio::spawn(
                            async move {
                                if let Err(e) = pipeline::serve_connection(
                                    shared, stream,
                                )
                                .await
                                {
                                    debug!("connection ended: {e}");
                                }
                            }
                            .instrument(debug_span!("conn", %peer)),
                        );
                    }
                    Err(e) => {
                        warn!("accept failed: {e}");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
            }
            _ = stopping.changed() => return,
        }
    }
}

/// Unreliable intake: each datagram is one complete frame carrying a
/// `Send`. Anything else is dropped.
async fn udp_loop(shared: Arc<BrokerShared>, socket: UdpSocket) {
    let mut buf = vec![0u8; 65536];
    let mut stopping = shared.shutdown.subscribe();
    loop {
        let n = tokio::select! {
            recv = socket.recv(&mut buf) => match recv {
                Ok(n) => n,
                Err(e) => {
                    warn!("udp receive failed: {e}");
                    continue;
                }
            },
            _ = stopping.changed() => return,
        };
        let frame = match decode_datagram(&buf[..n]) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("bad datagram: {e}");
                continue;
            }
        };
        if frame.code != RequestCode::Send {
            debug!(code = ?frame.code, "unexpected datagram code");
            continue;
        }
        match Message::decode(&mut frame.reader()) {
            Ok(msg) => {
                if let Err(e) = shared.handler.publish(msg).await {
                    debug!("datagram publish failed: {e}");
                }
            }
            Err(e) => debug!("bad datagram message: {e}"),
        }
    }
}

/// Owns a connection's write half: everything queued on the record goes
/// out here, one frame at a time.
pub(crate) async fn writer_loop(
    mut writer: FrameWriter<tokio::net::tcp::OwnedWriteHalf>,
    mut outbound: mpsc::Receiver<Frame>,
) {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = writer.write(&frame).await {
            debug!("write failed: {e}");
            return;
        }
    }
}
