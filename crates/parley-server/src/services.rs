//! Wiring: backends in, a ready-to-serve set of services out.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use parley_core::ids::{IdGenerator, UuidV7Generator};
use parley_settings::{DeliverySettings, Settings};
use parley_store::{
    DurableQueue, FastCache, GroupStore, MemoryCache, MemoryQueue, MemoryStore, MessageHandler,
    MessageStore,
};

use crate::auth::{AllowAll, AuthVerifier};
use crate::consumer::{self, GroupFanout, PrivateRedelivery};
use crate::delivery::DeliveryEngine;
use crate::dispatcher::Dispatcher;
use crate::membership::MembershipService;
use crate::pump::SessionConfig;
use crate::registry::Registry;
use crate::sweeper;
use crate::sync::OfflineSync;

/// External collaborators. Core logic only ever sees these traits.
#[derive(Clone)]
pub struct Backends {
    pub messages: Arc<dyn MessageStore>,
    pub groups: Arc<dyn GroupStore>,
    pub cache: Arc<dyn FastCache>,
    pub queue: Arc<dyn DurableQueue>,
    pub ids: Arc<dyn IdGenerator>,
    pub auth: Arc<dyn AuthVerifier>,
}

impl Backends {
    /// Everything in process memory; accepts any login.
    pub fn in_memory() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            messages: store.clone(),
            groups: store,
            cache: Arc::new(MemoryCache::new()),
            queue: Arc::new(MemoryQueue::new()),
            ids: Arc::new(UuidV7Generator),
            auth: Arc::new(AllowAll),
        }
    }
}

pub struct Services {
    pub registry: Arc<Registry>,
    pub membership: Arc<MembershipService>,
    pub delivery: Arc<DeliveryEngine>,
    pub sync: Arc<OfflineSync>,
    pub dispatcher: Arc<Dispatcher>,
    pub session: SessionConfig,
    messages: Arc<dyn MessageStore>,
    cache: Arc<dyn FastCache>,
    queue: Arc<dyn DurableQueue>,
    delivery_settings: DeliverySettings,
}

impl Services {
    pub fn new(backends: Backends, settings: &Settings) -> Self {
        let registry = Arc::new(Registry::new());
        let membership = Arc::new(
            MembershipService::new(backends.groups.clone(), backends.cache.clone())
                .with_members_ttl(settings.delivery.group_members_ttl()),
        );
        let delivery = Arc::new(DeliveryEngine::new(
            registry.clone(),
            backends.messages.clone(),
            membership.clone(),
            backends.cache.clone(),
            backends.queue.clone(),
            backends.ids.clone(),
            settings.delivery.clone(),
        ));
        let sync = Arc::new(OfflineSync::new(
            backends.cache.clone(),
            backends.messages.clone(),
            &settings.delivery,
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            backends.auth.clone(),
            delivery.clone(),
            sync.clone(),
            membership.clone(),
            backends.messages.clone(),
            backends.cache.clone(),
            settings.delivery.presence_ttl(),
        ));

        Self {
            registry,
            membership,
            delivery,
            sync,
            dispatcher,
            session: SessionConfig::from(&settings.session),
            messages: backends.messages,
            cache: backends.cache,
            queue: backends.queue,
            delivery_settings: settings.delivery.clone(),
        }
    }

    /// Start the private and group topic consumers and the cache sweeper.
    pub fn spawn_background(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let handlers: Vec<(String, Arc<dyn MessageHandler>)> = vec![
            (
                self.delivery_settings.private_topic.clone(),
                Arc::new(PrivateRedelivery::new(self.registry.clone(), self.messages.clone()))
                    as Arc<dyn MessageHandler>,
            ),
            (
                self.delivery_settings.group_topic.clone(),
                Arc::new(GroupFanout::new(self.registry.clone(), self.membership.clone()))
                    as Arc<dyn MessageHandler>,
            ),
        ];
        let mut handles = consumer::spawn_consumers(
            self.queue.clone(),
            &self.delivery_settings.consumer_group,
            handlers,
            cancel,
        );
        handles.push(sweeper::spawn_cache_sweeper(
            self.cache.clone(),
            self.delivery_settings.cache_sweep_interval(),
            cancel,
        ));
        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use parley_core::ids::UserId;
    use parley_core::messages::MessageType;
    use std::time::Duration;

    #[tokio::test]
    async fn wiring_delivers_parked_message_through_consumer() {
        let services = Services::new(Backends::in_memory(), &Settings::default());
        let cancel = CancellationToken::new();

        let bob = UserId::from_raw("bob");
        let msg = services
            .delivery
            .send_private(&UserId::from_raw("alice"), &bob, MessageType::Text, "hi".into())
            .await
            .unwrap();

        let (session, mut rx) = Session::new(8);
        let _ = services.registry.register(session.clone());
        session.open();
        let _ = services.registry.bind_user(bob, &session);

        let handles = services.spawn_background(&cancel);
        assert_eq!(handles.len(), 3);
        let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(frame.contains(msg.id.as_str()));

        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
