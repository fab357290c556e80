use std::sync::Arc;

use futures::future::BoxFuture;

use super::subscriptions::Engine;
use crate::error::Result;
use crate::proto::Message;

/// What a subdomain handler is willing to do, negotiated at connect time.
/// The broker never invokes an operation the handler does not advertise;
/// it surfaces `NotImplemented` to the client instead.
#[derive(Clone, Copy, Debug)]
pub struct Capabilities {
    pub has_send: bool,
    pub has_sync_send: bool,
    pub has_subscribe: bool,
    pub has_unsubscribe: bool,
    pub has_subscribe_and_get: bool,
    pub has_send_and_get: bool,
    pub has_shutdown: bool,
}

impl Capabilities {
    pub fn all() -> Self {
        Self {
            has_send: true,
            has_sync_send: true,
            has_subscribe: true,
            has_unsubscribe: true,
            has_subscribe_and_get: true,
            has_send_and_get: true,
            has_shutdown: true,
        }
    }
}

/// The pluggable back-end a broker routes client traffic into. The
/// default messaging subdomain delivers to in-memory subscriptions;
/// alternative handlers (queues, files, databases) live behind this same
/// seam.
pub trait SubdomainHandler: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    /// Delivers a message to everything locally subscribed to it,
    /// returning how many local deliveries were made.
    fn publish<'a>(&'a self, msg: Message) -> BoxFuture<'a, Result<usize>>;
}

/// The capability object for delivering a message to this broker's local
/// subscribers. Explicitly passed to every bridge callback and notifier
/// waiter rather than living in any process-global state, so several
/// broker instances can coexist in one process.
#[derive(Clone)]
pub struct LocalDelivery {
    engine: Arc<Engine>,
}

impl LocalDelivery {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Publishes to local standing subscriptions and one-shot getters
    /// only. Never re-propagates to bridges; messages cross broker
    /// boundaries solely through bridged subscriptions.
    pub async fn publish(&self, msg: Message) -> usize {
        self.engine.publish(&msg).await
    }
}

/// The default publish/subscribe subdomain: full capability set, delivery
/// straight into the subscription engine.
pub struct MessagingSubdomain {
    delivery: LocalDelivery,
}

impl MessagingSubdomain {
    pub fn new(delivery: LocalDelivery) -> Self {
        Self { delivery }
    }
}

impl SubdomainHandler for MessagingSubdomain {
    fn capabilities(&self) -> Capabilities {
        Capabilities::all()
    }

    fn publish<'a>(&'a self, msg: Message) -> BoxFuture<'a, Result<usize>> {
        Box::pin(async move { Ok(self.delivery.publish(msg).await) })
    }
}
