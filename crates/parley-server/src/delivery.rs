//! Push-now or park-for-later decisions for private and group messages.

use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};

use parley_core::envelope::Envelope;
use parley_core::ids::{GroupId, IdGenerator, MessageId, UserId};
use parley_core::messages::{Message, MessageStatus, MessageType, Recipient};
use parley_settings::DeliverySettings;
use parley_store::{DurableQueue, FastCache, MessageStore};

use crate::errors::ChatError;
use crate::membership::MembershipService;
use crate::registry::Registry;

/// Result of trying to hand a frame to a user's live session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushOutcome {
    Pushed,
    Backpressure,
    Offline,
}

/// Enqueue `frame` on `user`'s OPEN session, never waiting.
pub fn push_to_user(registry: &Registry, user: &UserId, frame: &Arc<String>) -> PushOutcome {
    let Some(session) = registry.lookup_by_user(user).filter(|s| s.is_open()) else {
        return PushOutcome::Offline;
    };
    match session.send_message(Arc::clone(frame)) {
        Ok(()) => PushOutcome::Pushed,
        Err(ChatError::Backpressure { .. }) => PushOutcome::Backpressure,
        Err(_) => PushOutcome::Offline,
    }
}

pub struct DeliveryEngine {
    registry: Arc<Registry>,
    store: Arc<dyn MessageStore>,
    membership: Arc<MembershipService>,
    cache: Arc<dyn FastCache>,
    queue: Arc<dyn DurableQueue>,
    ids: Arc<dyn IdGenerator>,
    settings: DeliverySettings,
}

impl DeliveryEngine {
    pub fn new(
        registry: Arc<Registry>,
        store: Arc<dyn MessageStore>,
        membership: Arc<MembershipService>,
        cache: Arc<dyn FastCache>,
        queue: Arc<dyn DurableQueue>,
        ids: Arc<dyn IdGenerator>,
        settings: DeliverySettings,
    ) -> Self {
        Self {
            registry,
            store,
            membership,
            cache,
            queue,
            ids,
            settings,
        }
    }

    /// Persist a private message, then push it live or park it on the
    /// offline path. Only persistence can fail the call.
    #[instrument(skip_all, fields(sender = %sender, receiver = %receiver))]
    pub async fn send_private(
        &self,
        sender: &UserId,
        receiver: &UserId,
        kind: MessageType,
        content: String,
    ) -> Result<Message, ChatError> {
        let message = Message::new(
            self.ids.next_id(),
            sender.clone(),
            Recipient::User(receiver.clone()),
            kind,
            content,
        );
        let frame = Arc::new(Envelope::push(&message)?.encode()?);
        self.persist(&message).await?;

        match push_to_user(&self.registry, receiver, &frame) {
            PushOutcome::Pushed => {
                debug!(message_id = %message.id, "pushed to live session");
                self.spawn_mark_delivered(message.id.clone());
            }
            outcome => {
                debug!(message_id = %message.id, ?outcome, "receiver unreachable, parking offline");
                self.park_offline(receiver, &message).await;
            }
        }
        Ok(message)
    }

    /// Persist a group message, fan it out to members with a local session,
    /// and publish it once to the group topic.
    #[instrument(skip_all, fields(sender = %sender, group_id = %group))]
    pub async fn send_group(
        &self,
        sender: &UserId,
        group: &GroupId,
        kind: MessageType,
        content: String,
    ) -> Result<Message, ChatError> {
        if !self.membership.is_member(group, sender).await? {
            return Err(ChatError::NotMember {
                group_id: group.clone(),
                user_id: sender.clone(),
            });
        }

        let message = Message::new(
            self.ids.next_id(),
            sender.clone(),
            Recipient::Group(group.clone()),
            kind,
            content,
        );
        let frame = Arc::new(Envelope::push(&message)?.encode()?);
        self.persist(&message).await?;

        let members = match self.membership.members(group).await {
            Ok(members) => members,
            Err(e) => {
                warn!(message_id = %message.id, error = %e, "member lookup failed, skipping local fan-out");
                Vec::new()
            }
        };
        let mut pushed = 0usize;
        let mut skipped = 0usize;
        for member in members.iter().filter(|m| *m != sender) {
            match push_to_user(&self.registry, member, &frame) {
                PushOutcome::Pushed => pushed += 1,
                PushOutcome::Backpressure => skipped += 1,
                PushOutcome::Offline => {}
            }
        }
        debug!(message_id = %message.id, pushed, skipped, "local fan-out done");

        if let Err(e) = self.queue.publish(&self.settings.group_topic, &message).await {
            warn!(message_id = %message.id, error = %e, "group topic publish failed");
        }
        Ok(message)
    }

    async fn persist(&self, message: &Message) -> Result<(), ChatError> {
        if let Err(e) = self.store.save_message(message).await {
            error!(message_id = %message.id, error = %e, "failed to persist message");
            return Err(e.into());
        }
        if let Err(e) = self
            .cache
            .cache_message(message, self.settings.message_cache_ttl())
            .await
        {
            warn!(message_id = %message.id, error = %e, "failed to cache message");
        }
        Ok(())
    }

    async fn park_offline(&self, receiver: &UserId, message: &Message) {
        if let Err(e) = self.queue.publish(&self.settings.private_topic, message).await {
            warn!(message_id = %message.id, error = %e, "offline topic publish failed");
        }
        let appended = self
            .cache
            .push_offline(receiver, message, self.settings.offline_ttl())
            .await;
        let trimmed = match appended {
            Ok(()) => {
                self.cache
                    .trim_offline(receiver, self.settings.offline_list_max)
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = trimmed {
            warn!(message_id = %message.id, error = %e, "failed to append to offline list");
        }
    }

    fn spawn_mark_delivered(&self, id: MessageId) {
        let store = Arc::clone(&self.store);
        let _ = tokio::spawn(async move {
            match store.update_status(&id, MessageStatus::Delivered).await {
                Ok(true) => {}
                Ok(false) => debug!(message_id = %id, "status already past delivered"),
                Err(e) => warn!(message_id = %id, error = %e, "failed to mark delivered"),
            }
        });
    }

    /// Cache-first read of a single message.
    pub async fn get_message(&self, id: &MessageId) -> Result<Message, ChatError> {
        match self.cache.cached_message(id).await {
            Ok(Some(message)) => return Ok(message),
            Ok(None) => {}
            Err(e) => warn!(message_id = %id, error = %e, "message cache read failed"),
        }
        let message = self.store.get_message(id).await?;
        if let Err(e) = self
            .cache
            .cache_message(&message, self.settings.message_cache_ttl())
            .await
        {
            warn!(message_id = %id, error = %e, "failed to cache message");
        }
        info!(message_id = %id, "message loaded from store");
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use async_trait::async_trait;
    use parley_core::ids::UuidV7Generator;
    use parley_store::{MemoryCache, MemoryQueue, MemoryStore, QueueError, StoreError};
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Fixture {
        registry: Arc<Registry>,
        store: Arc<MemoryStore>,
        cache: Arc<MemoryCache>,
        queue: Arc<MemoryQueue>,
        membership: Arc<MembershipService>,
        engine: DeliveryEngine,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(Registry::new());
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemoryCache::new());
        let queue = Arc::new(MemoryQueue::new());
        let membership = Arc::new(MembershipService::new(store.clone(), cache.clone()));
        let engine = DeliveryEngine::new(
            registry.clone(),
            store.clone(),
            membership.clone(),
            cache.clone(),
            queue.clone(),
            Arc::new(UuidV7Generator),
            DeliverySettings::default(),
        );
        Fixture {
            registry,
            store,
            cache,
            queue,
            membership,
            engine,
        }
    }

    fn user(s: &str) -> UserId {
        UserId::from_raw(s)
    }

    fn online(registry: &Registry, name: &str, capacity: usize) -> (Arc<Session>, mpsc::Receiver<Arc<String>>) {
        let (session, rx) = Session::new(capacity);
        registry.register(session.clone());
        session.open();
        registry.bind_user(user(name), &session);
        (session, rx)
    }

    async fn wait_for_status(store: &MemoryStore, id: &MessageId, status: MessageStatus) {
        for _ in 0..200 {
            if store.get_message(id).await.unwrap().status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("message {id} never reached {status}");
    }

    #[tokio::test]
    async fn private_to_online_receiver_pushes_once_and_marks_delivered() {
        let f = fixture();
        let (_bob, mut rx) = online(&f.registry, "bob", 8);

        let msg = f
            .engine
            .send_private(&user("alice"), &user("bob"), MessageType::Text, "hi".into())
            .await
            .unwrap();
        assert_eq!(msg.status, MessageStatus::Sent);

        let frame = rx.recv().await.unwrap();
        let env = Envelope::decode(&frame).unwrap();
        assert_eq!(env.kind, "new_message");
        assert_eq!(env.data["id"], msg.id.as_str());
        assert!(rx.try_recv().is_err());

        wait_for_status(&f.store, &msg.id, MessageStatus::Delivered).await;
        assert!(f.queue.published("offline_msg").is_empty());
        assert_eq!(f.cache.offline_len(&user("bob")), 0);
    }

    #[tokio::test]
    async fn private_to_offline_receiver_takes_durable_path() {
        let f = fixture();
        let msg = f
            .engine
            .send_private(&user("alice"), &user("bob"), MessageType::Text, "hi".into())
            .await
            .unwrap();

        let published = f.queue.published("offline_msg");
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].id, msg.id);
        assert_eq!(f.cache.offline_len(&user("bob")), 1);
        assert_eq!(f.store.get_message(&msg.id).await.unwrap().status, MessageStatus::Sent);
    }

    #[tokio::test]
    async fn private_to_backpressured_receiver_is_treated_as_offline() {
        let f = fixture();
        let (bob, mut rx) = online(&f.registry, "bob", 1);
        bob.send_message(Arc::new("filler".into())).unwrap();

        f.engine
            .send_private(&user("alice"), &user("bob"), MessageType::Text, "hi".into())
            .await
            .unwrap();

        assert_eq!(&*rx.recv().await.unwrap(), "filler");
        assert!(rx.try_recv().is_err());
        assert_eq!(f.queue.published("offline_msg").len(), 1);
        assert_eq!(f.cache.offline_len(&user("bob")), 1);
    }

    #[tokio::test]
    async fn offline_list_is_capped() {
        let mut f = fixture();
        let mut settings = DeliverySettings::default();
        settings.offline_list_max = 2;
        f.engine = DeliveryEngine::new(
            f.registry.clone(),
            f.store.clone(),
            f.membership.clone(),
            f.cache.clone(),
            f.queue.clone(),
            Arc::new(UuidV7Generator),
            settings,
        );
        for i in 0..5 {
            f.engine
                .send_private(&user("alice"), &user("bob"), MessageType::Text, format!("{i}"))
                .await
                .unwrap();
        }
        assert_eq!(f.cache.offline_len(&user("bob")), 2);
        assert_eq!(f.queue.published("offline_msg").len(), 5);
    }

    struct BrokenStore;

    #[async_trait]
    impl MessageStore for BrokenStore {
        async fn save_message(&self, _: &Message) -> Result<(), StoreError> {
            Err(StoreError::Database("disk full".into()))
        }
        async fn get_message(&self, id: &MessageId) -> Result<Message, StoreError> {
            Err(StoreError::NotFound(id.to_string()))
        }
        async fn list_undelivered(&self, _: &UserId, _: Option<&MessageId>, _: usize) -> Result<Vec<Message>, StoreError> {
            Ok(Vec::new())
        }
        async fn update_status(&self, _: &MessageId, _: MessageStatus) -> Result<bool, StoreError> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn persistence_failure_aborts_without_delivery() {
        let f = fixture();
        let (_bob, mut rx) = online(&f.registry, "bob", 8);
        let engine = DeliveryEngine::new(
            f.registry.clone(),
            Arc::new(BrokenStore),
            f.membership.clone(),
            f.cache.clone(),
            f.queue.clone(),
            Arc::new(UuidV7Generator),
            DeliverySettings::default(),
        );

        let err = engine
            .send_private(&user("alice"), &user("bob"), MessageType::Text, "hi".into())
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Store(StoreError::Database(_))));
        assert!(rx.try_recv().is_err());
        assert!(f.queue.published("offline_msg").is_empty());
    }

    struct DownQueue;

    #[async_trait]
    impl DurableQueue for DownQueue {
        async fn publish(&self, topic: &str, _: &Message) -> Result<(), QueueError> {
            Err(QueueError::Publish {
                topic: topic.to_string(),
                detail: "broker unreachable".into(),
            })
        }
        async fn consume(
            &self,
            _: &str,
            _: &str,
            _: Arc<dyn parley_store::MessageHandler>,
            _: tokio_util::sync::CancellationToken,
        ) -> Result<(), QueueError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn queue_failure_does_not_fail_send() {
        let f = fixture();
        let engine = DeliveryEngine::new(
            f.registry.clone(),
            f.store.clone(),
            f.membership.clone(),
            f.cache.clone(),
            Arc::new(DownQueue),
            Arc::new(UuidV7Generator),
            DeliverySettings::default(),
        );
        let msg = engine
            .send_private(&user("alice"), &user("bob"), MessageType::Text, "hi".into())
            .await
            .unwrap();
        assert!(f.store.get_message(&msg.id).await.is_ok());
        assert_eq!(f.cache.offline_len(&user("bob")), 1);
    }

    #[tokio::test]
    async fn group_send_fans_out_and_publishes_once() {
        let f = fixture();
        let group = f
            .membership
            .create_group(&user("a"), "abc", "", &[user("b"), user("c")])
            .await
            .unwrap();
        let (_a, mut rx_a) = online(&f.registry, "a", 8);
        let (_b, mut rx_b) = online(&f.registry, "b", 8);
        let (_c, mut rx_c) = online(&f.registry, "c", 8);

        let msg = f
            .engine
            .send_group(&user("a"), &group.id, MessageType::Text, "hello all".into())
            .await
            .unwrap();
        assert_eq!(msg.group_id(), Some(&group.id));

        for rx in [&mut rx_b, &mut rx_c] {
            let env = Envelope::decode(&rx.recv().await.unwrap()).unwrap();
            assert_eq!(env.kind, "new_group_message");
            assert!(rx.try_recv().is_err());
        }
        assert!(rx_a.try_recv().is_err());
        assert_eq!(f.queue.published("group_chat").len(), 1);
    }

    #[tokio::test]
    async fn group_send_swallows_member_backpressure() {
        let f = fixture();
        let group = f
            .membership
            .create_group(&user("a"), "g", "", &[user("b"), user("c")])
            .await
            .unwrap();
        let (b, _rx_b) = online(&f.registry, "b", 1);
        b.send_message(Arc::new("filler".into())).unwrap();
        let (_c, mut rx_c) = online(&f.registry, "c", 8);

        f.engine
            .send_group(&user("a"), &group.id, MessageType::Text, "x".into())
            .await
            .unwrap();
        assert!(rx_c.recv().await.is_some());
        assert_eq!(f.queue.published("group_chat").len(), 1);
    }

    #[tokio::test]
    async fn group_send_by_non_member_is_rejected() {
        let f = fixture();
        let group = f.membership.create_group(&user("a"), "g", "", &[]).await.unwrap();
        let err = f
            .engine
            .send_group(&user("mallory"), &group.id, MessageType::Text, "x".into())
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::NotMember { .. }));
        assert_eq!(f.store.message_count(), 0);
        assert!(f.queue.published("group_chat").is_empty());
    }

    #[tokio::test]
    async fn get_message_reads_through_cache() {
        let f = fixture();
        let msg = f
            .engine
            .send_private(&user("alice"), &user("bob"), MessageType::Text, "hi".into())
            .await
            .unwrap();
        assert_eq!(f.engine.get_message(&msg.id).await.unwrap().id, msg.id);
        assert!(matches!(
            f.engine.get_message(&MessageId::from_raw("nope")).await,
            Err(ChatError::Store(StoreError::NotFound(_)))
        ));
    }
}
