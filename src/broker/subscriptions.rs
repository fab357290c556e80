use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use hashbrown::{HashMap, HashSet};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, trace, warn};

use super::bridge::Bridge;
use super::ClientRecord;
use crate::error::code;
use crate::proto::{
    encode_reply, matches, CloudStatus, Frame, Message, RequestCode,
    WireWriter,
};

/// How long a fanned-out get waits on a peer before the bridge gives up
/// on that copy. Generous on purpose: the origin cancels it long before
/// this whenever the request is answered or abandoned.
const REMOTE_GET_TIMEOUT: Duration = Duration::from_secs(600);

/// Single-fire completion latch for a get-style request. The first
/// source to deliver a satisfying answer wins the compare-and-swap;
/// every later answer (and the timeout racing it) is a no-op.
pub struct Notifier {
    fired: AtomicBool,
    notify: Notify,
}

impl Notifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { fired: AtomicBool::new(false), notify: Notify::new() })
    }

    /// Returns true for exactly one caller, ever.
    pub fn fire(&self) -> bool {
        let won = self
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.notify.notify_waiters();
        }
        won
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    pub async fn wait(&self) {
        loop {
            if self.has_fired() {
                return;
            }
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.has_fired() {
                return;
            }
            notified.await;
        }
    }
}

/// What a subscription is keyed on. The namespace compares literally;
/// subject and kind are `*`/`?` patterns matched against messages.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct SubKey {
    pub namespace: String,
    pub subject: String,
    pub kind: String,
}

struct Getter {
    notifier: Arc<Notifier>,
    requester: Arc<ClientRecord>,
}

struct SendGet {
    notifier: Arc<Notifier>,
    requester: Arc<ClientRecord>,
    /// Kept for replaying the request to a peer that joins while the
    /// get is still outstanding.
    msg: Message,
}

struct SubEntry {
    /// token -> (record, that client's subscription ids under this key)
    subscribers: HashMap<u64, (Arc<ClientRecord>, HashSet<u64>)>,
    /// (token, id) -> one-shot waiter
    getters: HashMap<(u64, u64), Getter>,
    /// Whether the currently in-cloud bridges have been told about a
    /// standing subscribe under this key.
    bridged: bool,
}

impl SubEntry {
    fn new() -> Self {
        Self {
            subscribers: HashMap::new(),
            getters: HashMap::new(),
            bridged: false,
        }
    }

    /// Entry-existence invariant: an entry lives in the table iff it has
    /// a standing subscriber or a one-shot getter.
    fn is_empty(&self) -> bool {
        self.subscribers.is_empty() && self.getters.is_empty()
    }

    /// Whether any standing subscriber is an ordinary client. Only those
    /// are exported to peers; a peer's own bridged subscription is never
    /// re-exported.
    fn has_exportable(&self) -> bool {
        self.subscribers.values().any(|(r, _)| !r.is_server)
    }
}

/// The global subscription table and the bridge set, guarded together by
/// one lock: every read-modify-write that spans both (subscribe + tell
/// all bridges, peer joins + replay the table) holds it for the whole
/// sequence. This is also what serializes a new subscribe against a
/// join-time replay.
struct Bridged {
    table: HashMap<SubKey, SubEntry>,
    bridges: HashMap<String, Arc<Bridge>>,
    /// (token, id) -> outstanding sendAndGet bookkeeping
    send_gets: HashMap<(u64, u64), SendGet>,
    /// locates the table entry owning an outstanding subscribeAndGet
    sub_get_index: HashMap<(u64, u64), SubKey>,
}

pub struct Engine {
    inner: Mutex<Bridged>,
}

/// Handle to one fanned-out copy of a get, for later cancellation.
struct RemoteGet {
    bridge: Arc<Bridge>,
    remote_id: u64,
}

impl Engine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Bridged {
                table: HashMap::new(),
                bridges: HashMap::new(),
                send_gets: HashMap::new(),
                sub_get_index: HashMap::new(),
            }),
        })
    }

    /// Registers a standing subscription. Idempotent for a repeated
    /// (token, sub_id) pair, so a retried resubscribe after failover
    /// cannot create duplicates. When the key gains its first ordinary
    /// subscriber, the subscribe is pushed to every in-cloud bridge under
    /// the same lock.
    pub async fn subscribe(
        &self,
        record: &Arc<ClientRecord>,
        sub_id: u64,
        key: SubKey,
    ) {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let entry =
            inner.table.entry(key.clone()).or_insert_with(SubEntry::new);
        let (_, ids) = entry
            .subscribers
            .entry(record.token)
            .or_insert_with(|| (record.clone(), HashSet::new()));
        if !ids.insert(sub_id) {
            trace!("duplicate subscribe ({}, {sub_id}), no-op", record.token);
            return;
        }
        if entry.has_exportable() && !entry.bridged {
            entry.bridged = true;
            for bridge in incloud_bridges(&inner.bridges) {
                if let Err(e) = bridge.server_subscribe(&key) {
                    warn!(
                        "subscribe fan-out to {} failed: {e}",
                        bridge.peer_name()
                    );
                }
            }
        }
    }

    /// Removes one standing subscription. Reference-counted remotely:
    /// peers are told to tear down only when the last ordinary subscriber
    /// for the key leaves.
    pub async fn unsubscribe(
        &self,
        record: &Arc<ClientRecord>,
        sub_id: u64,
        key: &SubKey,
    ) {
        let mut inner = self.inner.lock().await;
        let Some(entry) = inner.table.get_mut(key) else { return };
        if let Some((_, ids)) = entry.subscribers.get_mut(&record.token) {
            ids.remove(&sub_id);
            if ids.is_empty() {
                entry.subscribers.remove(&record.token);
            }
        }
        self.after_removal(&mut inner, key);
    }

    /// Shared tail of unsubscribe paths: tear down remote interest when
    /// the last exportable subscriber left, and drop the entry when the
    /// existence invariant says so.
    fn after_removal(&self, inner: &mut Bridged, key: &SubKey) {
        let Some(entry) = inner.table.get_mut(key) else { return };
        let retract = entry.bridged && !entry.has_exportable();
        if retract {
            entry.bridged = false;
            let bridges = incloud_bridges(&inner.bridges);
            for bridge in bridges {
                if let Err(e) = bridge.server_unsubscribe(key) {
                    warn!(
                        "unsubscribe fan-out to {} failed: {e}",
                        bridge.peer_name()
                    );
                }
            }
        }
        if inner.table.get(key).map_or(false, SubEntry::is_empty) {
            inner.table.remove(key);
        }
    }

    /// Delivers a message to every matching standing subscription and
    /// completes every matching one-shot getter. Frames go out after the
    /// lock is released so a slow consumer cannot stall the table.
    /// Returns the number of deliveries.
    pub async fn publish(self: &Arc<Self>, msg: &Message) -> usize {
        self.publish_scoped(msg, false).await
    }

    /// `local_only` is set for messages that arrived over a bridge: they
    /// must reach ordinary clients only, never be forwarded to another
    /// peer, or a fully connected cloud would echo them forever.
    pub async fn publish_scoped(
        self: &Arc<Self>,
        msg: &Message,
        local_only: bool,
    ) -> usize {
        let mut outbox: Vec<(Arc<ClientRecord>, Frame)> = Vec::new();
        {
            let mut guard = self.inner.lock().await;
            let inner = &mut *guard;
            let mut emptied: Vec<SubKey> = Vec::new();
            for (key, entry) in inner.table.iter_mut() {
                if key.namespace != msg.namespace
                    || !matches(&key.subject, &msg.subject)
                    || !matches(&key.kind, &msg.kind)
                {
                    continue;
                }
                for (record, ids) in entry.subscribers.values() {
                    // get-request messages reach peers through the
                    // explicit fan-out (which rewrites the reply-routing
                    // stamps), never through a bridged subscription
                    if record.is_server && (local_only || msg.is_get_request) {
                        continue;
                    }
                    for sub_id in ids {
                        outbox.push((
                            record.clone(),
                            delivery_frame(*sub_id, msg),
                        ));
                    }
                }
                // one-shot waiters complete on first match
                let won: Vec<(u64, u64)> = entry
                    .getters
                    .iter()
                    .filter(|(_, g)| {
                        !(local_only && g.requester.is_server)
                    })
                    .map(|(t, _)| *t)
                    .collect();
                for target in won {
                    if let Some(getter) = entry.getters.remove(&target) {
                        if getter.notifier.fire() {
                            outbox.push((
                                getter.requester.clone(),
                                get_response_frame(target.1, msg),
                            ));
                        }
                    }
                }
                if entry.is_empty() {
                    emptied.push(key.clone());
                }
            }
            for key in &emptied {
                inner.table.remove(key);
            }
            // every completed getter needs its index entry dropped too
            let table = &inner.table;
            inner.sub_get_index.retain(|target, k| {
                table.get(k).map_or(false, |e| e.getters.contains_key(target))
            });
        }
        let count = outbox.len();
        for (record, frame) in outbox {
            if !record.deliver(frame).await {
                debug!("delivery to {} failed, client gone", record.name);
            }
        }
        count
    }

    /// Registers a one-shot subscribeAndGet and fans it out to every
    /// in-cloud peer, skipping any peer once the notifier has already
    /// fired. A background waiter cancels all remote copies the moment
    /// the first answer lands anywhere.
    pub async fn subscribe_and_get(
        self: &Arc<Self>,
        record: &Arc<ClientRecord>,
        id: u64,
        key: SubKey,
        notifier: Arc<Notifier>,
    ) {
        let target = (record.token, id);
        let mut remotes = Vec::new();
        {
            let mut inner = self.inner.lock().await;
            inner
                .table
                .entry(key.clone())
                .or_insert_with(SubEntry::new)
                .getters
                .insert(
                    target,
                    Getter {
                        notifier: notifier.clone(),
                        requester: record.clone(),
                    },
                );
            inner.sub_get_index.insert(target, key.clone());
            if !record.is_server {
                for bridge in incloud_bridges(&inner.bridges) {
                    if notifier.has_fired() {
                        break;
                    }
                    remotes.push(self.spawn_remote_sub_get(
                        bridge, target, &key,
                    ));
                }
            }
        }
        self.spawn_canceller(
            notifier,
            remotes,
            RequestCode::ServerUnsubscribeAndGet,
        );
    }

    /// Registers a sendAndGet (the publish itself happens through the
    /// subdomain handler) and fans the request out to in-cloud peers.
    pub async fn send_and_get(
        self: &Arc<Self>,
        record: &Arc<ClientRecord>,
        id: u64,
        msg: &Message,
        notifier: Arc<Notifier>,
    ) {
        let target = (record.token, id);
        let mut remotes = Vec::new();
        {
            let mut inner = self.inner.lock().await;
            inner.send_gets.insert(
                target,
                SendGet {
                    notifier: notifier.clone(),
                    requester: record.clone(),
                    msg: msg.clone(),
                },
            );
            if !record.is_server {
                for bridge in incloud_bridges(&inner.bridges) {
                    if notifier.has_fired() {
                        break;
                    }
                    remotes.push(self.spawn_remote_send_get(
                        bridge, target, msg,
                    ));
                }
            }
        }
        self.spawn_canceller(notifier, remotes, RequestCode::ServerUnSendAndGet);
    }

    fn spawn_remote_sub_get(
        self: &Arc<Self>,
        bridge: Arc<Bridge>,
        target: (u64, u64),
        key: &SubKey,
    ) -> RemoteGet {
        let remote_id = bridge.next_corr();
        let engine = self.clone();
        let key = key.clone();
        let task_bridge = bridge.clone();
        tokio::spawn(async move {
            match task_bridge
                .server_subscribe_and_get(remote_id, &key, REMOTE_GET_TIMEOUT)
                .await
            {
                Ok(msg) => engine.complete_sub_get(target, &msg).await,
                Err(e) => trace!(
                    "remote subscribeAndGet on {} ended: {e}",
                    task_bridge.peer_name()
                ),
            }
        });
        RemoteGet { bridge, remote_id }
    }

    fn spawn_remote_send_get(
        self: &Arc<Self>,
        bridge: Arc<Bridge>,
        target: (u64, u64),
        msg: &Message,
    ) -> RemoteGet {
        let remote_id = bridge.next_corr();
        let engine = self.clone();
        let msg = msg.clone();
        let task_bridge = bridge.clone();
        tokio::spawn(async move {
            match task_bridge
                .server_send_and_get(remote_id, &msg, REMOTE_GET_TIMEOUT)
                .await
            {
                Ok(msg) => engine.complete_send_get(target, &msg).await,
                Err(e) => trace!(
                    "remote sendAndGet on {} ended: {e}",
                    task_bridge.peer_name()
                ),
            }
        });
        RemoteGet { bridge, remote_id }
    }

    /// The background waiter: blocks on the notifier and, once it fires,
    /// tells every peer that was asked to forget its copy. At most one
    /// extra round trip stays outstanding per request.
    fn spawn_canceller(
        &self,
        notifier: Arc<Notifier>,
        remotes: Vec<RemoteGet>,
        forget: RequestCode,
    ) {
        if remotes.is_empty() {
            return;
        }
        tokio::spawn(async move {
            notifier.wait().await;
            for remote in remotes {
                let mut w = WireWriter::new();
                w.put_u64(remote.remote_id);
                if let Err(e) =
                    remote.bridge.forget(forget, w.finish()).await
                {
                    trace!(
                        "forget to {} failed: {e}",
                        remote.bridge.peer_name()
                    );
                }
            }
        });
    }

    /// Completes a subscribeAndGet from a remote answer. Suppressed when
    /// a local (or faster peer) answer already fired the notifier.
    pub async fn complete_sub_get(&self, target: (u64, u64), msg: &Message) {
        let won = {
            let mut inner = self.inner.lock().await;
            let Some(key) = inner.sub_get_index.remove(&target) else {
                return;
            };
            let getter = inner
                .table
                .get_mut(&key)
                .and_then(|e| e.getters.remove(&target));
            if inner.table.get(&key).map_or(false, SubEntry::is_empty) {
                inner.table.remove(&key);
            }
            getter.filter(|g| g.notifier.fire())
        };
        if let Some(getter) = won {
            let frame = get_response_frame(target.1, msg);
            getter.requester.deliver(frame).await;
        }
    }

    /// Completes a sendAndGet: routes the response to the requester if
    /// this answer came first, and drops it silently otherwise.
    pub async fn complete_send_get(&self, target: (u64, u64), msg: &Message) {
        let won = {
            let mut inner = self.inner.lock().await;
            inner
                .send_gets
                .remove(&target)
                .filter(|g| g.notifier.fire())
        };
        if let Some(get) = won {
            let frame = get_response_frame(target.1, msg);
            get.requester.deliver(frame).await;
        }
    }

    /// Routes an inbound get-response message straight to whoever asked.
    pub async fn route_get_response(&self, msg: &Message) {
        self.complete_send_get((msg.sender_token, msg.sender_id), msg).await;
    }

    /// Cancels an outstanding subscribeAndGet (client timeout or death).
    /// Firing the notifier is what triggers remote cancellation.
    pub async fn cancel_sub_get(&self, target: (u64, u64)) {
        let mut inner = self.inner.lock().await;
        if let Some(key) = inner.sub_get_index.remove(&target) {
            if let Some(entry) = inner.table.get_mut(&key) {
                if let Some(getter) = entry.getters.remove(&target) {
                    getter.notifier.fire();
                }
            }
            if inner.table.get(&key).map_or(false, SubEntry::is_empty) {
                inner.table.remove(&key);
            }
        }
    }

    /// Cancels an outstanding sendAndGet.
    pub async fn cancel_send_get(&self, target: (u64, u64)) {
        let mut inner = self.inner.lock().await;
        if let Some(get) = inner.send_gets.remove(&target) {
            get.notifier.fire();
        }
    }

    /// Marks a bridge in-cloud and replays the entire current table (and
    /// every still-outstanding get) to it, all under the subscribe lock
    /// so no concurrent subscribe can be dropped or duplicated.
    pub async fn register_bridge(self: &Arc<Self>, bridge: Arc<Bridge>) {
        let mut inner = self.inner.lock().await;
        debug!("replaying table to {}", bridge.peer_name());
        for (key, entry) in inner.table.iter_mut() {
            if entry.has_exportable() {
                entry.bridged = true;
                if let Err(e) = bridge.server_subscribe(key) {
                    warn!("replay subscribe to {} failed: {e}",
                        bridge.peer_name());
                }
            }
            for (target, getter) in entry.getters.iter() {
                if getter.requester.is_server || getter.notifier.has_fired() {
                    continue;
                }
                let remote = self.spawn_remote_sub_get(
                    bridge.clone(),
                    *target,
                    key,
                );
                self.spawn_canceller(
                    getter.notifier.clone(),
                    vec![remote],
                    RequestCode::ServerUnsubscribeAndGet,
                );
            }
        }
        let send_gets: Vec<_> = inner
            .send_gets
            .iter()
            .filter(|(_, g)| {
                !g.requester.is_server && !g.notifier.has_fired()
            })
            .map(|(t, g)| (*t, g.msg.clone(), g.notifier.clone()))
            .collect();
        for (target, msg, notifier) in send_gets {
            let remote =
                self.spawn_remote_send_get(bridge.clone(), target, &msg);
            self.spawn_canceller(
                notifier,
                vec![remote],
                RequestCode::ServerUnSendAndGet,
            );
        }
        inner.bridges.insert(bridge.peer_name().to_string(), bridge);
    }

    /// Adds a bridge that is not (yet) in the cloud. No replay happens
    /// until the peer announces `INCLOUD`.
    pub async fn add_bridge(&self, bridge: Arc<Bridge>) {
        self.inner
            .lock()
            .await
            .bridges
            .insert(bridge.peer_name().to_string(), bridge);
    }

    pub async fn remove_bridge(&self, peer_name: &str) -> Option<Arc<Bridge>> {
        self.inner.lock().await.bridges.remove(peer_name)
    }

    pub async fn bridge(&self, peer_name: &str) -> Option<Arc<Bridge>> {
        self.inner.lock().await.bridges.get(peer_name).cloned()
    }

    pub async fn bridges(&self) -> Vec<Arc<Bridge>> {
        self.inner.lock().await.bridges.values().cloned().collect()
    }

    pub async fn incloud(&self) -> Vec<Arc<Bridge>> {
        incloud_bridges(&self.inner.lock().await.bridges)
    }

    /// Tears out every trace of a dying client: its standing
    /// subscriptions (propagating retractions to peers), its one-shot
    /// getters and its outstanding sendAndGets (firing their notifiers so
    /// remote copies get cancelled).
    pub async fn remove_client(&self, record: &Arc<ClientRecord>) {
        let token = record.token;
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let keys: Vec<SubKey> = inner
            .table
            .iter()
            .filter(|(_, e)| {
                e.subscribers.contains_key(&token)
                    || e.getters.keys().any(|(t, _)| *t == token)
            })
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            if let Some(entry) = inner.table.get_mut(&key) {
                entry.subscribers.remove(&token);
                let dropped: Vec<_> = entry
                    .getters
                    .keys()
                    .filter(|(t, _)| *t == token)
                    .cloned()
                    .collect();
                for target in dropped {
                    if let Some(getter) = entry.getters.remove(&target) {
                        getter.notifier.fire();
                    }
                    inner.sub_get_index.remove(&target);
                }
            }
            self.after_removal(inner, &key);
        }
        let dead_gets: Vec<_> = inner
            .send_gets
            .keys()
            .filter(|(t, _)| *t == token)
            .cloned()
            .collect();
        for target in dead_gets {
            if let Some(get) = inner.send_gets.remove(&target) {
                get.notifier.fire();
            }
        }
    }

    pub async fn subscription_count(&self) -> usize {
        self.inner.lock().await.table.len()
    }

    /// Outstanding get bookkeeping, for observing quiescence.
    pub async fn pending_get_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.send_gets.len()
            + inner
                .table
                .values()
                .map(|e| e.getters.len())
                .sum::<usize>()
    }
}

fn incloud_bridges(
    bridges: &HashMap<String, Arc<Bridge>>,
) -> Vec<Arc<Bridge>> {
    bridges
        .values()
        .filter(|b| b.status() == CloudStatus::InCloud && b.is_alive())
        .cloned()
        .collect()
}

fn delivery_frame(sub_id: u64, msg: &Message) -> Frame {
    let mut w = WireWriter::new();
    w.put_u64(sub_id);
    let mut body = w.finish();
    body.extend_from_slice(&msg.encode());
    Frame::new(RequestCode::MessageDelivery, body)
}

fn get_response_frame(id: u64, msg: &Message) -> Frame {
    Frame::new(
        RequestCode::GetResponse,
        encode_reply(id, code::OK, &msg.encode()),
    )
}
