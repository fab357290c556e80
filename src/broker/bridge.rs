use std::sync::{
    atomic::{AtomicU8, Ordering},
    Arc,
};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, debug_span, trace, warn, Instrument};

use super::subscriptions::{Engine, SubKey};
use crate::client::{Channel, ChannelEvent};
use crate::error::{Error, Result};
use crate::proto::{
    CloudStatus, ConnectReply, ConnectRequest, GetRequest, LockRequest,
    Message, RequestCode, WireReader, WireWriter, PROTOCOL_VERSION,
};

/// Outgoing server-to-server connection to one cloud peer. A bridge is a
/// specialized client of the remote broker: it registers with
/// `ServerConnect`, pushes this broker's subscription interest across,
/// and republishes whatever the peer delivers to local clients only.
///
/// Peers are identified by their listen URL; both sides of a broker pair
/// key their bridge maps on it.
pub struct Bridge {
    peer_url: String,
    channel: Arc<Channel>,
    /// Peer's membership state, updated by `CloudSetStatus` frames and
    /// stored in wire encoding.
    status: AtomicU8,
    /// Subscribe/unsubscribe traffic for the peer. Queued so callers,
    /// which may hold the engine lock, never block on the socket; a
    /// single drainer keeps the frames in call order.
    control: mpsc::UnboundedSender<(RequestCode, Vec<u8>)>,
    ack_timeout: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// What this broker tells a peer about itself at bridge time.
#[derive(Clone)]
pub struct BridgeIdentity {
    pub name: String,
    pub url: String,
    pub password: String,
    pub keepalive_ms: u32,
}

impl Bridge {
    /// Dials a peer broker and runs the `ServerConnect` handshake. The
    /// returned status is the peer's membership state at handshake time.
    pub async fn connect(
        peer_url: &str,
        identity: &BridgeIdentity,
        engine: Arc<Engine>,
        ack_timeout: Duration,
    ) -> Result<Arc<Self>> {
        let stream = TcpStream::connect(peer_url).await?;
        stream.set_nodelay(true)?;
        let (channel, events) = Channel::open(stream);

        let corr = channel.next_corr();
        let req = ConnectRequest {
            corr,
            version: PROTOCOL_VERSION,
            password: identity.password.clone(),
            name: identity.name.clone(),
            namespace: String::new(),
            host: hostname(),
            server_url: identity.url.clone(),
            keepalive_ms: identity.keepalive_ms,
        };
        let reply = channel
            .call(RequestCode::ServerConnect, corr, req.encode(), ack_timeout)
            .await?;
        let body = reply.ok()?;
        let ack = ConnectReply::decode(&mut WireReader::new(&body))?;
        debug!(peer = %peer_url, status = ?ack.cloud_status, "bridged");

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let bridge = Arc::new(Self {
            peer_url: peer_url.to_string(),
            channel,
            status: AtomicU8::new(ack.cloud_status.to_wire()),
            control: control_tx,
            ack_timeout,
            tasks: Mutex::new(Vec::new()),
        });

        let events_task = tokio::spawn(
            event_loop(bridge.clone(), engine, events).instrument(
                debug_span!("bridge", peer = %peer_url),
            ),
        );
        let control_task = tokio::spawn(
            control_loop(bridge.channel.clone(), control_rx).instrument(
                debug_span!("bridge-control", peer = %peer_url),
            ),
        );
        let keepalive_task = tokio::spawn(
            keepalive_loop(
                bridge.channel.clone(),
                Duration::from_millis(u64::from(identity.keepalive_ms).max(100)),
            )
            .instrument(debug_span!("bridge-keepalive", peer = %peer_url)),
        );
        *bridge.tasks.lock().await =
            vec![events_task, control_task, keepalive_task];
        Ok(bridge)
    }

    pub fn peer_name(&self) -> &str {
        &self.peer_url
    }

    pub fn is_alive(&self) -> bool {
        self.channel.is_alive()
    }

    pub fn status(&self) -> CloudStatus {
        CloudStatus::from_wire(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: CloudStatus) {
        self.status.store(status.to_wire(), Ordering::Release);
    }

    /// Ids for fanned-out gets. Allocated by the channel so they share
    /// one namespace with every other call on this connection.
    pub fn next_corr(&self) -> u64 {
        self.channel.next_corr()
    }

    /// Pushes standing interest in a key to the peer. Fire-and-forget:
    /// these travel the peer's ordered subscribe queue, so a subscribe
    /// followed by an unsubscribe can never be applied in reverse.
    pub fn server_subscribe(&self, key: &SubKey) -> Result<()> {
        self.queue_control(RequestCode::ServerSubscribe, sub_body(key))
    }

    pub fn server_unsubscribe(&self, key: &SubKey) -> Result<()> {
        self.queue_control(RequestCode::ServerUnsubscribe, sub_body(key))
    }

    fn queue_control(&self, code: RequestCode, body: Vec<u8>) -> Result<()> {
        if !self.channel.is_alive() {
            return Err(Error::ConnectionLost);
        }
        self.control.send((code, body)).map_err(|_| Error::ConnectionLost)
    }

    /// One fanned-out copy of a subscribeAndGet. Resolves when the peer
    /// answers with a `GetResponse` correlated on `id`, or errors on
    /// timeout/cancellation.
    pub async fn server_subscribe_and_get(
        &self,
        id: u64,
        key: &SubKey,
        timeout: Duration,
    ) -> Result<Message> {
        let req = GetRequest {
            corr: id,
            id,
            subject: key.subject.clone(),
            kind: key.kind.clone(),
            namespace: key.namespace.clone(),
        };
        let reply = self
            .channel
            .call(RequestCode::ServerSubscribeAndGet, id, req.encode(), timeout)
            .await?;
        let body = reply.ok()?;
        Message::decode(&mut WireReader::new(&body))
    }

    /// One fanned-out copy of a sendAndGet.
    pub async fn server_send_and_get(
        &self,
        id: u64,
        msg: &Message,
        timeout: Duration,
    ) -> Result<Message> {
        let mut w = WireWriter::new();
        w.put_u64(id);
        let mut body = w.finish();
        body.extend_from_slice(&msg.encode());
        let reply = self
            .channel
            .call(RequestCode::ServerSendAndGet, id, body, timeout)
            .await?;
        let body = reply.ok()?;
        Message::decode(&mut WireReader::new(&body))
    }

    /// Cancels a fanned-out get on the peer. Best effort.
    pub async fn forget(&self, code: RequestCode, body: Vec<u8>) -> Result<()> {
        self.channel.notify(code, body).await
    }

    /// Names of every ordinary client registered on the peer, for the
    /// cloud-wide unique-name check.
    pub async fn send_names(&self) -> Result<Vec<String>> {
        let corr = self.channel.next_corr();
        let mut w = WireWriter::new();
        w.put_u64(corr);
        let reply = self
            .channel
            .call(
                RequestCode::ServerSendNames,
                corr,
                w.finish(),
                self.ack_timeout,
            )
            .await?;
        let body = reply.ok()?;
        let mut r = WireReader::new(&body);
        let count = r.u32()? as usize;
        let mut names = Vec::with_capacity(count);
        for _ in 0..count {
            names.push(r.str()?);
        }
        Ok(names)
    }

    /// The peer's current view of the cloud: (listen URL, status) pairs
    /// including the peer itself. Drives transitive discovery.
    pub async fn cloud_peers(&self) -> Result<Vec<(String, CloudStatus)>> {
        let corr = self.channel.next_corr();
        let mut w = WireWriter::new();
        w.put_u64(corr);
        let reply = self
            .channel
            .call(
                RequestCode::ServerCloudPeers,
                corr,
                w.finish(),
                self.ack_timeout,
            )
            .await?;
        let body = reply.ok()?;
        let mut r = WireReader::new(&body);
        let count = r.u32()? as usize;
        let mut peers = Vec::with_capacity(count);
        for _ in 0..count {
            let url = r.str()?;
            let status = CloudStatus::from_wire(r.u8()?);
            peers.push((url, status));
        }
        Ok(peers)
    }

    pub async fn cloud_lock(
        &self,
        holder: &str,
        timeout: Duration,
    ) -> Result<()> {
        self.lock_call(RequestCode::CloudLock, holder, timeout).await
    }

    pub async fn cloud_unlock(&self, holder: &str) -> Result<()> {
        self.lock_call(RequestCode::CloudUnlock, holder, self.ack_timeout)
            .await
    }

    pub async fn registration_lock(
        &self,
        holder: &str,
        timeout: Duration,
    ) -> Result<()> {
        self.lock_call(RequestCode::RegistrationLock, holder, timeout)
            .await
    }

    pub async fn registration_unlock(&self, holder: &str) -> Result<()> {
        self.lock_call(
            RequestCode::RegistrationUnlock,
            holder,
            self.ack_timeout,
        )
        .await
    }

    async fn lock_call(
        &self,
        code: RequestCode,
        holder: &str,
        timeout: Duration,
    ) -> Result<()> {
        let corr = self.channel.next_corr();
        let req = LockRequest {
            corr,
            holder: holder.to_string(),
            timeout_ms: timeout.as_millis() as u32,
        };
        // the peer may hold the request for the full lock timeout before
        // answering, so the call deadline gets headroom on top of it
        let reply = self
            .channel
            .call(code, corr, req.encode(), timeout + self.ack_timeout)
            .await?;
        reply.ok().map(|_| ())
    }

    /// Announces this broker's new membership status to the peer.
    pub async fn announce_status(&self, status: CloudStatus) -> Result<()> {
        let corr = self.channel.next_corr();
        let mut w = WireWriter::new();
        w.put_u64(corr).put_u8(status.to_wire());
        let reply = self
            .channel
            .call(
                RequestCode::CloudSetStatus,
                corr,
                w.finish(),
                self.ack_timeout,
            )
            .await?;
        reply.ok().map(|_| ())
    }

    /// Fans a shutdown-clients request out to the peer.
    pub async fn server_shutdown_clients(
        &self,
        pattern: &str,
    ) -> Result<()> {
        let mut w = WireWriter::new();
        w.put_u64(0).put_str(pattern);
        self.channel
            .notify(RequestCode::ServerShutdownClients, w.finish())
            .await
    }

    /// Orders the peer broker to shut itself down.
    pub async fn request_shutdown(&self) -> Result<()> {
        self.channel
            .notify(RequestCode::ShutdownNotice, Vec::new())
            .await
    }

    pub async fn close(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        self.channel.close().await;
    }
}

/// Drains queued control frames onto the channel in order. A write
/// failure kills the connection; the event loop notices and removes the
/// bridge.
async fn control_loop(
    channel: Arc<Channel>,
    mut control: mpsc::UnboundedReceiver<(RequestCode, Vec<u8>)>,
) {
    while let Some((code, body)) = control.recv().await {
        if let Err(e) = channel.notify(code, body).await {
            debug!("bridge control write failed: {e}");
            channel.close().await;
            return;
        }
    }
}

/// Keeps the peer's idle watchdog quiet. A failed keep-alive closes the
/// channel, which surfaces in the event loop as a dead bridge.
async fn keepalive_loop(channel: Arc<Channel>, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        if !channel.is_alive() {
            return;
        }
        let corr = channel.next_corr();
        let mut w = WireWriter::new();
        w.put_u64(corr);
        if let Err(e) = channel
            .call(RequestCode::KeepAlive, corr, w.finish(), interval * 2)
            .await
        {
            debug!("bridge keep-alive failed: {e}");
            channel.close().await;
            return;
        }
    }
}

fn sub_body(key: &SubKey) -> Vec<u8> {
    GetRequest {
        corr: 0,
        id: 0,
        subject: key.subject.clone(),
        kind: key.kind.clone(),
        namespace: key.namespace.clone(),
    }
    .encode()
}

/// Consumes events from the bridge's channel: deliveries from the peer
/// are republished to local clients only, and a dying connection removes
/// the bridge from the engine so fan-outs stop naming it.
async fn event_loop(
    bridge: Arc<Bridge>,
    engine: Arc<Engine>,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::Delivery { msg, .. } => {
                if msg.is_get_response {
                    engine.route_get_response(&msg).await;
                } else {
                    let n = engine.publish_scoped(&msg, true).await;
                    trace!(subject = %msg.subject, n, "peer delivery");
                }
            }
            ChannelEvent::ShutdownNotice | ChannelEvent::Dead => break,
        }
    }
    // the stream also just ends when the channel is torn down elsewhere
    warn!("bridge connection lost");
    engine.remove_bridge(bridge.peer_name()).await;
    bridge.channel.close().await;
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| String::from("localhost"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::code;
    use crate::proto::{encode_frame, encode_reply, Frame, FrameReader};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn identity() -> BridgeIdentity {
        BridgeIdentity {
            name: "127.0.0.1:9".into(),
            url: "127.0.0.1:9".into(),
            password: String::new(),
            // long enough that no keep-alive fires during the test
            keepalive_ms: 60_000,
        }
    }

    #[tokio::test]
    async fn queued_control_frames_reach_the_peer_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let peer = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = FrameReader::new(read_half);
            let connect = reader.read().await.unwrap();
            assert_eq!(connect.code, RequestCode::ServerConnect);
            let req = ConnectRequest::decode(&connect.body).unwrap();
            let ack = ConnectReply {
                token: 1,
                cloud_status: CloudStatus::InCloud,
                udp_port: 0,
            };
            let frame = Frame::new(
                RequestCode::Reply,
                encode_reply(req.corr, code::OK, &ack.encode()),
            );
            write_half.write_all(&encode_frame(&frame)).await.unwrap();

            let first = reader.read().await.unwrap();
            let second = reader.read().await.unwrap();
            (first.code, second.code)
        });

        let engine = Engine::new();
        let bridge =
            Bridge::connect(&addr, &identity(), engine, Duration::from_secs(1))
                .await
                .unwrap();

        let key = SubKey {
            namespace: "/test".into(),
            subject: "orders".into(),
            kind: "*".into(),
        };
        bridge.server_subscribe(&key).unwrap();
        bridge.server_unsubscribe(&key).unwrap();

        let (first, second) = peer.await.unwrap();
        assert_eq!(first, RequestCode::ServerSubscribe);
        assert_eq!(second, RequestCode::ServerUnsubscribe);
        bridge.close().await;
    }
}
