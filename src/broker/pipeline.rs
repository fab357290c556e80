//! Per-connection request pipeline: the registration handshake, frame
//! classification into the three queues, and the worker pools that drain
//! them.
//!
//! Queue discipline: subscription traffic is processed by exactly one
//! worker so a subscribe can never be overtaken by the unsubscribe that
//! follows it; lock and membership traffic gets its own worker so a
//! joining broker cannot be starved by message load; everything else is
//! drained by a small pool, growing by short-lived extra workers when
//! the queue runs hot.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, debug_span, trace, warn, Instrument};

use super::cloud::{
    ensure_bridge, register_client_cloudwide, RegistrationGuard,
};
use super::subscriptions::{Notifier, SubKey};
use super::{writer_loop, BrokerShared, ClientRecord};
use crate::error::{code, Error, Result};
use crate::proto::{
    encode_reply, matches, CloudStatus, ConnectReply, ConnectRequest, Frame,
    FrameReader, FrameWriter, GetRequest, LockRequest, Message, RequestCode,
    WireWriter, PROTOCOL_VERSION,
};

/// How long a registration may sit waiting for the membership gate.
const GATE_WAIT: Duration = Duration::from_secs(30);
/// An extra worker exits after this long without work.
const TEMP_WORKER_IDLE: Duration = Duration::from_millis(500);
/// Upper bound on extra workers per connection.
const TEMP_WORKER_CAP: usize = 8;

/// Runs one accepted socket from handshake to cleanup.
pub async fn serve_connection(
    shared: Arc<BrokerShared>,
    stream: TcpStream,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half);
    let mut writer = FrameWriter::new(write_half);

    let first = tokio::time::timeout(
        shared.config.ack_timeout,
        reader.read(),
    )
    .await
    .map_err(|_| Error::Timeout)??;

    let is_server = match first.code {
        RequestCode::ClientConnect => false,
        RequestCode::ServerConnect => true,
        other => {
            return Err(Error::Protocol(format!(
                "expected a connect frame, got {other:?}"
            )))
        }
    };
    let req = ConnectRequest::decode(&first.body)?;

    let reg_guard = match admit(&shared, &req, is_server).await {
        Ok(guard) => guard,
        Err(e) => {
            let frame = Frame::new(
                RequestCode::Reply,
                encode_reply(req.corr, e.wire_code(), &[]),
            );
            writer.write(&frame).await?;
            return Err(e);
        }
    };

    // registration is final from here: build the record, start its
    // writer, and acknowledge
    let token = shared.next_token();
    let (outbound, outbound_rx) =
        mpsc::channel::<Frame>(shared.config.queue_depth);
    let record = Arc::new(ClientRecord::new(
        token,
        req.name.clone(),
        req.namespace.clone(),
        is_server,
        if is_server { req.server_url.clone() } else { String::new() },
        req.keepalive_ms,
        outbound,
    ));
    let writer_task = tokio::spawn(writer_loop(writer, outbound_rx));
    shared.clients.write().await.insert(token, record.clone());
    // the name is visible in the table now; contending registrants may
    // run their checks
    if let Some(guard) = reg_guard {
        guard.release().await;
    }

    let ack = ConnectReply {
        token,
        cloud_status: *shared.status.read().await,
        udp_port: shared.udp_port as u32,
    };
    record
        .deliver(Frame::new(
            RequestCode::Reply,
            encode_reply(req.corr, code::OK, &ack.encode()),
        ))
        .await;
    debug!(name = %req.name, token, is_server, "registered");

    // a peer registering with us gets a reciprocal bridge so traffic
    // can flow both ways
    if is_server && !req.server_url.is_empty() {
        let shared2 = shared.clone();
        let peer_url = req.server_url.clone();
        tokio::spawn(async move {
            if let Err(e) = ensure_bridge(&shared2, &peer_url).await {
                warn!("reciprocal bridge to {peer_url} failed: {e}");
            }
        });
    }

    let outcome = run_pipeline(&shared, &record, reader)
        .instrument(debug_span!("pipeline", client = %record.name))
        .await;
    shared.cleanup_client(&record).await;
    writer_task.abort();
    outcome
}

/// Everything that can refuse a registration before a record exists:
/// version and password checks, the membership gate, and the cloud-wide
/// unique-name rule. For an ordinary client the returned guard keeps
/// the registration locks held until the record is inserted.
async fn admit(
    shared: &Arc<BrokerShared>,
    req: &ConnectRequest,
    is_server: bool,
) -> Result<Option<RegistrationGuard>> {
    if req.version != PROTOCOL_VERSION {
        return Err(Error::Protocol(format!(
            "protocol version {} not supported",
            req.version
        )));
    }
    if req.password != shared.config.password {
        return Err(Error::WrongPassword);
    }
    if is_server {
        // peers get in while the gate is closed only when this broker is
        // itself bridging (or bridged) to them, or mid-join
        let gate_open = *shared.gate.borrow();
        let reciprocal = !req.server_url.is_empty()
            && (shared.engine.bridge(&req.server_url).await.is_some()
                || shared
                    .connecting
                    .lock()
                    .await
                    .contains(&req.server_url));
        let joining =
            *shared.status.read().await == CloudStatus::BecomingCloud;
        if !(gate_open || reciprocal || joining) {
            return Err(Error::ConnectFailed(
                "broker is not accepting peers yet".into(),
            ));
        }
        return Ok(None);
    }

    let mut gate = shared.gate.subscribe();
    let waited = tokio::time::timeout(GATE_WAIT, async {
        while !*gate.borrow_and_update() {
            if gate.changed().await.is_err() {
                break;
            }
        }
    })
    .await;
    if waited.is_err() {
        return Err(Error::Timeout);
    }
    register_client_cloudwide(shared, &req.name).await.map(Some)
}

struct Queues {
    normal: mpsc::Sender<Frame>,
    subs: mpsc::Sender<Frame>,
    locks: mpsc::Sender<Frame>,
    workers: Vec<JoinHandle<()>>,
    shared_rx: Arc<Mutex<mpsc::Receiver<Frame>>>,
    temp_count: Arc<AtomicUsize>,
}

/// Reads frames until the connection dies, classifying each onto a
/// queue. Keep-alives are answered inline so a loaded queue can never
/// make a healthy client look dead.
async fn run_pipeline(
    shared: &Arc<BrokerShared>,
    record: &Arc<ClientRecord>,
    mut reader: FrameReader<tokio::net::tcp::OwnedReadHalf>,
) -> Result<()> {
    let queues = start_workers(shared, record);
    let idle_budget = read_deadline(record.keepalive_ms);
    let depth = shared.config.queue_depth;
    let mut stopping = shared.shutdown.subscribe();

    let outcome = loop {
        let read = tokio::select! {
            read = tokio::time::timeout(idle_budget, reader.read()) => read,
            _ = stopping.changed() => break Err(Error::ConnectionLost),
        };
        let frame = match read {
            Ok(Ok(frame)) => frame,
            Ok(Err(e)) => break Err(e),
            Err(_) => {
                debug!("client went silent, dropping");
                break Err(Error::ConnectionLost);
            }
        };
        record.touch();
        record.received.fetch_add(1, Ordering::Relaxed);

        match frame.code {
            RequestCode::KeepAlive => {
                let corr = frame.reader().u64()?;
                record
                    .deliver(Frame::new(
                        RequestCode::Reply,
                        encode_reply(corr, code::OK, &[]),
                    ))
                    .await;
            }
            RequestCode::ClientDisconnect => break Ok(()),
            RequestCode::Subscribe
            | RequestCode::Unsubscribe
            | RequestCode::SubscribeAndGet
            | RequestCode::UnsubscribeAndGet
            | RequestCode::ServerSubscribe
            | RequestCode::ServerUnsubscribe
            | RequestCode::ServerSubscribeAndGet
            | RequestCode::ServerUnsubscribeAndGet => {
                if queues.subs.send(frame).await.is_err() {
                    break Err(Error::ConnectionLost);
                }
            }
            RequestCode::CloudLock
            | RequestCode::CloudUnlock
            | RequestCode::RegistrationLock
            | RequestCode::RegistrationUnlock
            | RequestCode::CloudSetStatus
            | RequestCode::ServerSendNames
            | RequestCode::ServerCloudPeers
            | RequestCode::ShutdownClients
            | RequestCode::ShutdownServers
            | RequestCode::ServerShutdownClients
            | RequestCode::ShutdownNotice => {
                if queues.locks.send(frame).await.is_err() {
                    break Err(Error::ConnectionLost);
                }
            }
            RequestCode::Send
            | RequestCode::SyncSend
            | RequestCode::SendAndGet
            | RequestCode::UnSendAndGet
            | RequestCode::ServerSend
            | RequestCode::ServerSendAndGet
            | RequestCode::ServerUnSendAndGet => {
                // grow the pool while the queue is running hot
                if !shared.config.time_ordered
                    && queues.normal.capacity() < depth / 4
                    && queues.temp_count.load(Ordering::Acquire)
                        < TEMP_WORKER_CAP
                {
                    spawn_temp_worker(shared, record, &queues);
                }
                if queues.normal.send(frame).await.is_err() {
                    break Err(Error::ConnectionLost);
                }
            }
            RequestCode::ClientConnect
            | RequestCode::ServerConnect
            | RequestCode::Reply
            | RequestCode::MessageDelivery
            | RequestCode::GetResponse => {
                break Err(Error::Protocol(format!(
                    "unexpected {:?} after registration",
                    frame.code
                )));
            }
        }
    };
    for worker in &queues.workers {
        worker.abort();
    }
    outcome
}

fn read_deadline(keepalive_ms: u32) -> Duration {
    if keepalive_ms == 0 {
        Duration::from_secs(3600)
    } else {
        Duration::from_millis(u64::from(keepalive_ms) * 3).max(
            Duration::from_secs(3),
        )
    }
}

fn start_workers(
    shared: &Arc<BrokerShared>,
    record: &Arc<ClientRecord>,
) -> Queues {
    let depth = shared.config.queue_depth;
    let (normal_tx, normal_rx) = mpsc::channel::<Frame>(depth);
    let (subs_tx, mut subs_rx) = mpsc::channel::<Frame>(depth);
    let (locks_tx, mut locks_rx) = mpsc::channel::<Frame>(depth);
    let shared_rx = Arc::new(Mutex::new(normal_rx));
    let mut workers = Vec::new();

    {
        let shared = shared.clone();
        let record = record.clone();
        workers.push(tokio::spawn(async move {
            while let Some(frame) = subs_rx.recv().await {
                handle_frame(&shared, &record, frame).await;
            }
        }));
    }
    {
        let shared = shared.clone();
        let record = record.clone();
        workers.push(tokio::spawn(async move {
            while let Some(frame) = locks_rx.recv().await {
                handle_frame(&shared, &record, frame).await;
            }
        }));
    }
    let permanent = if shared.config.time_ordered {
        1
    } else {
        shared.config.workers.max(1)
    };
    for _ in 0..permanent {
        let shared = shared.clone();
        let record = record.clone();
        let rx = shared_rx.clone();
        workers.push(tokio::spawn(async move {
            loop {
                let frame = { rx.lock().await.recv().await };
                match frame {
                    Some(frame) => {
                        handle_frame(&shared, &record, frame).await
                    }
                    None => return,
                }
            }
        }));
    }

    Queues {
        normal: normal_tx,
        subs: subs_tx,
        locks: locks_tx,
        workers,
        shared_rx,
        temp_count: Arc::new(AtomicUsize::new(0)),
    }
}

/// A short-lived extra worker: drains the shared normal queue and exits
/// once it sits idle.
fn spawn_temp_worker(
    shared: &Arc<BrokerShared>,
    record: &Arc<ClientRecord>,
    queues: &Queues,
) {
    queues.temp_count.fetch_add(1, Ordering::AcqRel);
    let shared = shared.clone();
    let record = record.clone();
    let rx = queues.shared_rx.clone();
    let count = queues.temp_count.clone();
    tokio::spawn(async move {
        trace!("temp worker up");
        loop {
            let frame = tokio::time::timeout(TEMP_WORKER_IDLE, async {
                rx.lock().await.recv().await
            })
            .await;
            match frame {
                Ok(Some(frame)) => {
                    handle_frame(&shared, &record, frame).await
                }
                Ok(None) | Err(_) => break,
            }
        }
        count.fetch_sub(1, Ordering::AcqRel);
        trace!("temp worker down");
    });
}

async fn reply(
    record: &Arc<ClientRecord>,
    corr: u64,
    status: u32,
    extra: &[u8],
) {
    record
        .deliver(Frame::new(
            RequestCode::Reply,
            encode_reply(corr, status, extra),
        ))
        .await;
}

/// Dispatches one classified frame. Decode failures answer with a
/// protocol-error status where a correlation id is recoverable and are
/// logged otherwise; the connection itself stays up.
async fn handle_frame(
    shared: &Arc<BrokerShared>,
    record: &Arc<ClientRecord>,
    frame: Frame,
) {
    if let Err(e) = dispatch(shared, record, frame).await {
        debug!(client = %record.name, "request failed: {e}");
    }
}

async fn dispatch(
    shared: &Arc<BrokerShared>,
    record: &Arc<ClientRecord>,
    frame: Frame,
) -> Result<()> {
    let caps = shared.handler.capabilities();
    match frame.code {
        RequestCode::Send => {
            if !caps.has_send {
                return Err(Error::NotImplemented("send".into()));
            }
            let mut msg = Message::decode(&mut frame.reader())?;
            if msg.is_get_response {
                // routing stamps are the requester's, leave them alone
                shared.engine.route_get_response(&msg).await;
            } else {
                msg.sender_token = record.token;
                shared.handler.publish(msg).await?;
            }
        }
        RequestCode::SyncSend => {
            let mut r = frame.reader();
            let corr = r.u64()?;
            if !caps.has_sync_send {
                reply(record, corr, code::NOT_IMPLEMENTED, &[]).await;
                return Ok(());
            }
            let mut msg = Message::decode(&mut r)?;
            let count = if msg.is_get_response {
                shared.engine.route_get_response(&msg).await;
                1
            } else {
                msg.sender_token = record.token;
                shared.handler.publish(msg).await?
            };
            let mut w = WireWriter::new();
            w.put_i32(count as i32);
            reply(record, corr, code::OK, &w.finish()).await;
        }
        RequestCode::Subscribe => {
            let req = GetRequest::decode(&frame.body)?;
            if !caps.has_subscribe {
                reply(record, req.corr, code::NOT_IMPLEMENTED, &[]).await;
                return Ok(());
            }
            shared
                .engine
                .subscribe(record, req.id, key_of(&req))
                .await;
            reply(record, req.corr, code::OK, &[]).await;
        }
        RequestCode::Unsubscribe => {
            let req = GetRequest::decode(&frame.body)?;
            if !caps.has_unsubscribe {
                reply(record, req.corr, code::NOT_IMPLEMENTED, &[]).await;
                return Ok(());
            }
            shared
                .engine
                .unsubscribe(record, req.id, &key_of(&req))
                .await;
            reply(record, req.corr, code::OK, &[]).await;
        }
        RequestCode::SubscribeAndGet => {
            let req = GetRequest::decode(&frame.body)?;
            if !caps.has_subscribe_and_get {
                reply(record, req.corr, code::NOT_IMPLEMENTED, &[]).await;
                return Ok(());
            }
            // no immediate reply: the answer arrives as a GetResponse
            // correlated on the request id
            shared
                .engine
                .subscribe_and_get(record, req.id, key_of(&req), Notifier::new())
                .await;
        }
        RequestCode::UnsubscribeAndGet => {
            let id = frame.reader().u64()?;
            shared.engine.cancel_sub_get((record.token, id)).await;
        }
        RequestCode::SendAndGet => {
            let mut r = frame.reader();
            let corr = r.u64()?;
            if !caps.has_send_and_get {
                reply(record, corr, code::NOT_IMPLEMENTED, &[]).await;
                return Ok(());
            }
            let mut msg = Message::decode(&mut r)?;
            msg.sender_token = record.token;
            msg.sender_id = corr;
            msg.is_get_request = true;
            // register before publishing so a responder racing us still
            // finds the bookkeeping
            shared
                .engine
                .send_and_get(record, corr, &msg, Notifier::new())
                .await;
            shared.handler.publish(msg).await?;
        }
        RequestCode::UnSendAndGet => {
            let id = frame.reader().u64()?;
            shared.engine.cancel_send_get((record.token, id)).await;
        }

        RequestCode::ServerSend => {
            let msg = Message::decode(&mut frame.reader())?;
            if msg.is_get_response {
                shared.engine.route_get_response(&msg).await;
            } else {
                shared.engine.publish_scoped(&msg, true).await;
            }
        }
        RequestCode::ServerSubscribe => {
            let req = GetRequest::decode(&frame.body)?;
            shared.engine.subscribe(record, req.id, key_of(&req)).await;
        }
        RequestCode::ServerUnsubscribe => {
            let req = GetRequest::decode(&frame.body)?;
            shared.engine.unsubscribe(record, req.id, &key_of(&req)).await;
        }
        RequestCode::ServerSubscribeAndGet => {
            let req = GetRequest::decode(&frame.body)?;
            shared
                .engine
                .subscribe_and_get(record, req.id, key_of(&req), Notifier::new())
                .await;
        }
        RequestCode::ServerUnsubscribeAndGet => {
            let id = frame.reader().u64()?;
            shared.engine.cancel_sub_get((record.token, id)).await;
            // cancellation ack, so the peer's outstanding call resolves
            // instead of idling out
            record
                .deliver(Frame::new(
                    RequestCode::GetResponse,
                    encode_reply(id, code::TIMEOUT, &[]),
                ))
                .await;
        }
        RequestCode::ServerSendAndGet => {
            let mut r = frame.reader();
            let id = r.u64()?;
            let mut msg = Message::decode(&mut r)?;
            // reroute responses to this connection: the answer travels
            // back over the bridge as a GetResponse correlated on `id`
            msg.sender_token = record.token;
            msg.sender_id = id;
            msg.is_get_request = true;
            shared
                .engine
                .send_and_get(record, id, &msg, Notifier::new())
                .await;
            shared.engine.publish_scoped(&msg, true).await;
        }
        RequestCode::ServerUnSendAndGet => {
            let id = frame.reader().u64()?;
            shared.engine.cancel_send_get((record.token, id)).await;
            record
                .deliver(Frame::new(
                    RequestCode::GetResponse,
                    encode_reply(id, code::TIMEOUT, &[]),
                ))
                .await;
        }
        RequestCode::ServerSendNames => {
            let corr = frame.reader().u64()?;
            let names = shared.client_names().await;
            let mut w = WireWriter::new();
            w.put_u32(names.len() as u32);
            for name in &names {
                w.put_str(name);
            }
            reply(record, corr, code::OK, &w.finish()).await;
        }
        RequestCode::ServerCloudPeers => {
            let corr = frame.reader().u64()?;
            let mut peers =
                vec![(shared.url.clone(), *shared.status.read().await)];
            for bridge in shared.engine.bridges().await {
                peers.push((bridge.peer_name().to_string(), bridge.status()));
            }
            let mut w = WireWriter::new();
            w.put_u32(peers.len() as u32);
            for (url, status) in &peers {
                w.put_str(url).put_u8(status.to_wire());
            }
            reply(record, corr, code::OK, &w.finish()).await;
        }

        RequestCode::CloudLock => {
            lock_request(shared, record, &frame, true, true).await?;
        }
        RequestCode::CloudUnlock => {
            lock_request(shared, record, &frame, true, false).await?;
        }
        RequestCode::RegistrationLock => {
            lock_request(shared, record, &frame, false, true).await?;
        }
        RequestCode::RegistrationUnlock => {
            lock_request(shared, record, &frame, false, false).await?;
        }
        RequestCode::CloudSetStatus => {
            let mut r = frame.reader();
            let corr = r.u64()?;
            let status = CloudStatus::from_wire(r.u8()?);
            debug!(peer = %record.server_url, ?status, "peer status change");
            reply(record, corr, code::OK, &[]).await;
            // the reciprocal bridge may still be dialing; retry briefly
            // rather than lose the announcement
            let shared = shared.clone();
            let peer_url = record.server_url.clone();
            tokio::spawn(async move {
                for _ in 0..100 {
                    if let Some(bridge) =
                        shared.engine.bridge(&peer_url).await
                    {
                        let was = bridge.status();
                        bridge.set_status(status);
                        // a peer turning in-cloud gets our table
                        // replayed over the reciprocal bridge
                        if status == CloudStatus::InCloud
                            && was != CloudStatus::InCloud
                        {
                            shared.engine.remove_bridge(&peer_url).await;
                            shared.engine.register_bridge(bridge).await;
                        }
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                warn!("status announcement for unknown peer {peer_url}");
            });
        }

        RequestCode::ShutdownClients => {
            let mut r = frame.reader();
            let corr = r.u64()?;
            let pattern = r.str()?;
            let include_self = r.u8()? != 0;
            if !caps.has_shutdown {
                reply(record, corr, code::NOT_IMPLEMENTED, &[]).await;
                return Ok(());
            }
            shutdown_matching_clients(
                shared,
                &pattern,
                (!include_self).then_some(record.token),
            )
            .await;
            for bridge in shared.engine.incloud().await {
                if let Err(e) = bridge.server_shutdown_clients(&pattern).await
                {
                    debug!(
                        "shutdown fan-out to {} failed: {e}",
                        bridge.peer_name()
                    );
                }
            }
            reply(record, corr, code::OK, &[]).await;
        }
        RequestCode::ServerShutdownClients => {
            let mut r = frame.reader();
            let _corr = r.u64()?;
            let pattern = r.str()?;
            shutdown_matching_clients(shared, &pattern, None).await;
        }
        RequestCode::ShutdownServers => {
            let mut r = frame.reader();
            let corr = r.u64()?;
            let pattern = r.str()?;
            let include_self = r.u8()? != 0;
            if !caps.has_shutdown {
                reply(record, corr, code::NOT_IMPLEMENTED, &[]).await;
                return Ok(());
            }
            for bridge in shared.engine.incloud().await {
                if matches(&pattern, bridge.peer_name()) {
                    if let Err(e) = bridge.request_shutdown().await {
                        debug!(
                            "shutdown of {} failed: {e}",
                            bridge.peer_name()
                        );
                    }
                }
            }
            reply(record, corr, code::OK, &[]).await;
            // the requester's own broker is spared unless asked for
            if include_self {
                shared.initiate_shutdown().await;
            }
        }
        RequestCode::ShutdownNotice => {
            // only a peer may order this broker down
            if record.is_server {
                shared.initiate_shutdown().await;
            }
        }

        other => {
            return Err(Error::Protocol(format!(
                "code {other:?} reached a worker"
            )))
        }
    }
    Ok(())
}

/// A peer's lock or unlock request against our member locks.
async fn lock_request(
    shared: &Arc<BrokerShared>,
    record: &Arc<ClientRecord>,
    frame: &Frame,
    cloud: bool,
    acquire: bool,
) -> Result<()> {
    let req = LockRequest::decode(&frame.body)?;
    let lock = if cloud { &shared.cloud_lock } else { &shared.reg_lock };
    let held = if cloud { &record.cloud_holder } else { &record.reg_holder };
    let status = if acquire {
        let timeout = Duration::from_millis(u64::from(req.timeout_ms))
            .min(shared.config.lock_timeout);
        if lock.acquire(&req.holder, timeout).await {
            // remembered per connection: cleanup releases a grant the
            // peer died holding
            *held.lock().await = Some(req.holder.clone());
            code::OK
        } else {
            code::LOCK_TIMEOUT
        }
    } else {
        if lock.release(&req.holder).await {
            let mut held = held.lock().await;
            if held.as_deref() == Some(req.holder.as_str()) {
                *held = None;
            }
        }
        code::OK
    };
    reply(record, req.corr, status, &[]).await;
    Ok(())
}

/// Sends a shutdown notice to every ordinary client whose name matches,
/// optionally sparing one token (the requester).
async fn shutdown_matching_clients(
    shared: &Arc<BrokerShared>,
    pattern: &str,
    spare: Option<u64>,
) {
    let targets: Vec<_> = shared
        .clients
        .read()
        .await
        .values()
        .filter(|r| {
            !r.is_server
                && Some(r.token) != spare
                && matches(pattern, &r.name)
        })
        .cloned()
        .collect();
    for target in targets {
        debug!(name = %target.name, "sending shutdown notice");
        target
            .deliver(Frame::new(RequestCode::ShutdownNotice, Vec::new()))
            .await;
    }
}

fn key_of(req: &GetRequest) -> SubKey {
    SubKey {
        namespace: req.namespace.clone(),
        subject: req.subject.clone(),
        kind: req.kind.clone(),
    }
}
