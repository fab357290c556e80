//! Cloud membership: the distributed locks, the joining protocol, and
//! bridge establishment with reciprocal-dial deduplication.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use super::bridge::Bridge;
use super::BrokerShared;
use crate::error::{Error, Result};
use crate::proto::CloudStatus;

/// One named lock a whole cloud agrees on. Each broker holds its own
/// instance; a joiner (or registering client) must win the lock on every
/// member to proceed. Re-acquiring under the same holder name is a no-op,
/// so a retried request cannot deadlock against itself.
pub struct DistributedLock {
    holder: Mutex<Option<String>>,
    freed: Notify,
}

impl DistributedLock {
    pub fn new() -> Self {
        Self { holder: Mutex::new(None), freed: Notify::new() }
    }

    /// Waits up to `timeout` for the lock. Returns false when somebody
    /// else still holds it at the deadline.
    pub async fn acquire(&self, who: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let mut holder = self.holder.lock().await;
                match holder.as_deref() {
                    None => {
                        *holder = Some(who.to_string());
                        return true;
                    }
                    Some(h) if h == who => return true,
                    Some(_) => {}
                }
            }
            let freed = self.freed.notified();
            tokio::pin!(freed);
            freed.as_mut().enable();
            if self.holder.lock().await.is_none() {
                continue;
            }
            if tokio::time::timeout_at(deadline, freed).await.is_err() {
                return false;
            }
        }
    }

    /// Releases only if `who` is the current holder.
    pub async fn release(&self, who: &str) -> bool {
        let mut holder = self.holder.lock().await;
        if holder.as_deref() == Some(who) {
            *holder = None;
            self.freed.notify_waiters();
            true
        } else {
            false
        }
    }

    pub async fn held_by(&self) -> Option<String> {
        self.holder.lock().await.clone()
    }
}

impl Default for DistributedLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Dials a peer (unless a bridge already exists) and registers it with
/// the engine. Reciprocal dials racing each other collapse through the
/// `connecting` set: the loser waits for the winner's bridge.
pub async fn ensure_bridge(
    shared: &Arc<BrokerShared>,
    peer_url: &str,
) -> Result<Arc<Bridge>> {
    if peer_url == shared.url {
        return Err(Error::Protocol("refusing to bridge to self".into()));
    }
    loop {
        if let Some(bridge) = shared.engine.bridge(peer_url).await {
            if bridge.is_alive() {
                return Ok(bridge);
            }
            shared.engine.remove_bridge(peer_url).await;
        }
        if shared.connecting.lock().await.insert(peer_url.to_string()) {
            break;
        }
        // another task is dialing this peer; poll for its result
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let outcome = Bridge::connect(
        peer_url,
        &shared.identity(),
        shared.engine.clone(),
        shared.config.ack_timeout,
    )
    .await;
    shared.connecting.lock().await.remove(peer_url);
    let bridge = outcome?;

    // a bridge between two in-cloud brokers carries subscription state
    // immediately; otherwise the replay waits for a status announcement
    let both_in = bridge.status() == CloudStatus::InCloud
        && *shared.status.read().await == CloudStatus::InCloud;
    if both_in {
        shared.engine.register_bridge(bridge.clone()).await;
    } else {
        shared.engine.add_bridge(bridge.clone()).await;
    }
    Ok(bridge)
}

/// Startup task of a broker configured with seed URLs: discover the
/// cloud, win every member's cloud lock, flip to in-cloud, replay state
/// both ways, then open the gate. Giving up after the retry budget makes
/// this broker a one-member cloud so clients are not locked out forever.
pub async fn join_cloud(shared: Arc<BrokerShared>, seeds: Vec<String>) {
    *shared.status.write().await = CloudStatus::BecomingCloud;

    let mut attempt = 0u32;
    loop {
        match try_join(&shared, &seeds).await {
            Ok(members) => {
                info!(members, "joined cloud");
                break;
            }
            Err(e) => {
                warn!(attempt, "cloud join attempt failed: {e}");
                match shared.config.backoff.delay(attempt) {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => {
                        warn!("giving up on joining, becoming standalone");
                        break;
                    }
                }
                attempt += 1;
            }
        }
    }

    *shared.status.write().await = CloudStatus::InCloud;
    let _ = shared.gate.send(true);
}

/// One joining attempt end to end. Any failure after locks were taken
/// releases them before returning so the next attempt (or another
/// joiner) is not wedged.
async fn try_join(
    shared: &Arc<BrokerShared>,
    seeds: &[String],
) -> Result<usize> {
    let members = discover(shared, seeds).await?;
    if members.is_empty() {
        return Err(Error::ConnectFailed(
            "no reachable in-cloud member".into(),
        ));
    }
    let quorum = members.len() / 2 + 1;
    let lock_timeout = shared.config.lock_timeout;

    // our own lock first: a member joining elsewhere contacts us too
    if !shared.cloud_lock.acquire(&shared.url, lock_timeout).await {
        return Err(Error::LockTimeout);
    }
    let mut locked: Vec<Arc<Bridge>> = Vec::new();
    let mut ok = true;
    for bridge in &members {
        match bridge.cloud_lock(&shared.url, lock_timeout).await {
            Ok(()) => locked.push(bridge.clone()),
            Err(e) => {
                debug!("cloud lock on {} refused: {e}", bridge.peer_name());
                // below a majority there is no point asking the rest
                ok = false;
                if locked.len() + 1 < quorum {
                    break;
                }
            }
        }
    }
    // every member must be locked, not just a majority
    if !ok || locked.len() != members.len() {
        release_all(shared, &locked).await;
        return Err(Error::LockTimeout);
    }

    *shared.status.write().await = CloudStatus::InCloud;
    for bridge in &members {
        bridge.set_status(CloudStatus::InCloud);
        if let Err(e) = bridge.announce_status(CloudStatus::InCloud).await {
            warn!("status announcement to {} failed: {e}", bridge.peer_name());
        }
        // push our table across; the peer replays its own on hearing
        // the announcement
        shared.engine.register_bridge(bridge.clone()).await;
    }
    release_all(shared, &locked).await;
    Ok(members.len())
}

async fn release_all(shared: &Arc<BrokerShared>, locked: &[Arc<Bridge>]) {
    for bridge in locked {
        if let Err(e) = bridge.cloud_unlock(&shared.url).await {
            debug!("cloud unlock on {} failed: {e}", bridge.peer_name());
        }
    }
    shared.cloud_lock.release(&shared.url).await;
}

/// Walks outward from the seeds until no new peer URL appears, and
/// returns a bridge to every reachable in-cloud member.
async fn discover(
    shared: &Arc<BrokerShared>,
    seeds: &[String],
) -> Result<Vec<Arc<Bridge>>> {
    let mut known: Vec<String> = Vec::new();
    let mut frontier: Vec<String> = seeds.to_vec();
    let mut members: Vec<Arc<Bridge>> = Vec::new();

    while let Some(url) = frontier.pop() {
        if url == shared.url || known.contains(&url) {
            continue;
        }
        known.push(url.clone());
        let bridge = match ensure_bridge(shared, &url).await {
            Ok(bridge) => bridge,
            Err(e) => {
                debug!("seed {url} unreachable: {e}");
                continue;
            }
        };
        match bridge.cloud_peers().await {
            Ok(peers) => {
                for (peer_url, _) in peers {
                    if peer_url != shared.url && !known.contains(&peer_url) {
                        frontier.push(peer_url);
                    }
                }
            }
            Err(e) => debug!("peer listing from {url} failed: {e}"),
        }
        if bridge.status() == CloudStatus::InCloud {
            members.push(bridge);
        }
    }
    Ok(members)
}

/// Registration locks still held on behalf of an admitted client. The
/// caller releases them only after the new record is in the client
/// table, so a racing registrant cannot pass the name check in the
/// window between check and insert.
pub struct RegistrationGuard {
    shared: Arc<BrokerShared>,
    holder: String,
    locked: Vec<Arc<Bridge>>,
}

impl RegistrationGuard {
    pub async fn release(self) {
        for bridge in &self.locked {
            if let Err(e) =
                bridge.registration_unlock(&self.holder).await
            {
                debug!(
                    "registration unlock on {} failed: {e}",
                    bridge.peer_name()
                );
            }
        }
        self.shared.reg_lock.release(&self.holder).await;
    }
}

/// Cloud-wide client registration: hold every member's registration lock
/// while checking the proposed name against every member's client list.
pub async fn register_client_cloudwide(
    shared: &Arc<BrokerShared>,
    name: &str,
) -> Result<RegistrationGuard> {
    let lock_timeout = shared.config.lock_timeout;
    // the holder is unique per attempt: two registrants of the same
    // name must contend, and a shared holder string would admit them
    // both through the reentrancy rule
    let holder = format!("{}#{}", shared.url, shared.next_token());
    if !shared.reg_lock.acquire(&holder, lock_timeout).await {
        return Err(Error::LockTimeout);
    }
    let members = shared.engine.incloud().await;
    let mut guard = RegistrationGuard {
        shared: shared.clone(),
        holder,
        locked: Vec::new(),
    };
    let mut outcome = Ok(());
    for bridge in &members {
        match bridge.registration_lock(&guard.holder, lock_timeout).await {
            Ok(()) => guard.locked.push(bridge.clone()),
            Err(e) => {
                debug!(
                    "registration lock on {} refused: {e}",
                    bridge.peer_name()
                );
                outcome = Err(Error::LockTimeout);
                break;
            }
        }
    }
    if outcome.is_ok() {
        if shared.client_names().await.iter().any(|n| n == name) {
            outcome = Err(Error::AlreadyExists(format!("client name {name}")));
        }
        for bridge in &guard.locked {
            if outcome.is_err() {
                break;
            }
            match bridge.send_names().await {
                Ok(names) => {
                    if names.iter().any(|n| n == name) {
                        outcome = Err(Error::AlreadyExists(format!(
                            "client name {name}"
                        )));
                    }
                }
                Err(e) => {
                    debug!(
                        "name listing from {} failed: {e}",
                        bridge.peer_name()
                    );
                }
            }
        }
    }
    match outcome {
        Ok(()) => Ok(guard),
        Err(e) => {
            guard.release().await;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lock_is_exclusive_until_released() {
        let lock = DistributedLock::new();
        assert!(lock.acquire("a", Duration::from_millis(50)).await);
        // reentrant for the same holder
        assert!(lock.acquire("a", Duration::from_millis(50)).await);
        assert!(!lock.acquire("b", Duration::from_millis(50)).await);

        assert!(lock.release("a").await);
        assert!(lock.acquire("b", Duration::from_millis(50)).await);
        assert_eq!(lock.held_by().await.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn release_by_non_holder_is_refused() {
        let lock = DistributedLock::new();
        assert!(lock.acquire("a", Duration::from_millis(10)).await);
        assert!(!lock.release("b").await);
        assert_eq!(lock.held_by().await.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn waiter_wins_the_lock_when_freed() {
        let lock = Arc::new(DistributedLock::new());
        assert!(lock.acquire("a", Duration::from_millis(10)).await);

        let contender = {
            let lock = lock.clone();
            tokio::spawn(async move {
                lock.acquire("b", Duration::from_secs(2)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        lock.release("a").await;
        assert!(contender.await.unwrap());
    }
}
