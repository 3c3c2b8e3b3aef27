//! Turns inbound frames into commands and answers on the originating session.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};

use parley_core::envelope::{
    kinds, AckRequest, AckResponse, Command, CreateGroupRequest, Envelope, GroupMembershipResponse,
    HeartbeatResponse, LoginRequest, LoginResponse, SendMessageRequest, SyncOfflineRequest,
    SyncOfflineResponse,
};
use parley_core::ids::UserId;
use parley_core::messages::Recipient;
use parley_core::presence::{PresenceStatus, UserPresence};
use parley_core::ProtocolError;
use parley_store::{FastCache, MessageStore};

use crate::auth::AuthVerifier;
use crate::delivery::DeliveryEngine;
use crate::errors::ChatError;
use crate::membership::MembershipService;
use crate::pump::FrameHandler;
use crate::registry::Registry;
use crate::session::Session;
use crate::sync::OfflineSync;

pub struct Dispatcher {
    registry: Arc<Registry>,
    auth: Arc<dyn AuthVerifier>,
    delivery: Arc<DeliveryEngine>,
    sync: Arc<OfflineSync>,
    membership: Arc<MembershipService>,
    store: Arc<dyn MessageStore>,
    cache: Arc<dyn FastCache>,
    presence_ttl: Duration,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<Registry>,
        auth: Arc<dyn AuthVerifier>,
        delivery: Arc<DeliveryEngine>,
        sync: Arc<OfflineSync>,
        membership: Arc<MembershipService>,
        store: Arc<dyn MessageStore>,
        cache: Arc<dyn FastCache>,
        presence_ttl: Duration,
    ) -> Self {
        Self {
            registry,
            auth,
            delivery,
            sync,
            membership,
            store,
            cache,
            presence_ttl,
        }
    }

    /// Route one decoded command. The returned envelope is the reply body;
    /// errors become error envelopes in [`FrameHandler::handle_frame`].
    #[instrument(skip_all, fields(connection_id = %session.id(), kind = command.kind()))]
    pub async fn dispatch(&self, session: &Arc<Session>, command: Command) -> Result<Envelope, ChatError> {
        match command {
            Command::Login(req) => self.login(session, req).await,
            Command::Heartbeat(_) => Ok(Envelope::with_payload(
                kinds::HEARTBEAT,
                &HeartbeatResponse {
                    timestamp: Utc::now().timestamp(),
                },
            )?),
            Command::SendMessage(req) => {
                let user = require_user(session, kinds::SEND_MESSAGE)?;
                self.send_message(&user, req).await
            }
            Command::Ack(req) => {
                let user = require_user(session, kinds::ACK)?;
                self.ack(&user, req).await
            }
            Command::SyncOffline(req) => {
                let user = require_user(session, kinds::SYNC_OFFLINE)?;
                self.sync_offline(&user, req).await
            }
            Command::CreateGroup(req) => {
                let user = require_user(session, kinds::CREATE_GROUP)?;
                self.create_group(&user, req).await
            }
            Command::JoinGroup(req) => {
                let user = require_user(session, kinds::JOIN_GROUP)?;
                let changed = self.membership.join(&req.group_id, &user).await?;
                Ok(Envelope::with_payload(
                    kinds::JOIN_GROUP,
                    &GroupMembershipResponse {
                        group_id: req.group_id,
                        member: true,
                        changed,
                    },
                )?)
            }
            Command::LeaveGroup(req) => {
                let user = require_user(session, kinds::LEAVE_GROUP)?;
                self.membership.leave(&req.group_id, &user).await?;
                Ok(Envelope::with_payload(
                    kinds::LEAVE_GROUP,
                    &GroupMembershipResponse {
                        group_id: req.group_id,
                        member: false,
                        changed: true,
                    },
                )?)
            }
        }
    }

    async fn login(&self, session: &Arc<Session>, req: LoginRequest) -> Result<Envelope, ChatError> {
        if !self.auth.verify(&req.user_id, &req.token).await {
            warn!(user_id = %req.user_id, "login rejected");
            return Err(ChatError::Auth { user_id: req.user_id });
        }

        let binding = self.registry.bind_user(req.user_id.clone(), session);
        if binding.is_refused() {
            warn!(user_id = %req.user_id, "login on a connection that is already closing");
            return Err(ChatError::Closed {
                connection_id: session.id().clone(),
            });
        }
        if let Some(evicted) = binding.evicted() {
            info!(
                user_id = %req.user_id,
                evicted = %evicted.id(),
                "newer login evicted previous session"
            );
        }

        let presence = UserPresence {
            user_id: req.user_id.clone(),
            status: PresenceStatus::Online,
            platform: req.platform,
            connection_id: session.id().clone(),
            last_seen: Utc::now().timestamp(),
        };
        if let Err(e) = self.cache.set_presence(&presence, self.presence_ttl).await {
            warn!(user_id = %req.user_id, error = %e, "failed to record presence");
        }
        info!(user_id = %req.user_id, "user logged in");

        Ok(Envelope::with_payload(
            kinds::LOGIN,
            &LoginResponse {
                success: true,
                message: "login successful".into(),
                user_id: req.user_id,
            },
        )?)
    }

    async fn send_message(&self, user: &UserId, req: SendMessageRequest) -> Result<Envelope, ChatError> {
        let message = match req.recipient {
            Recipient::User(receiver) => {
                self.delivery
                    .send_private(user, &receiver, req.kind, req.content)
                    .await?
            }
            Recipient::Group(group) => {
                self.delivery
                    .send_group(user, &group, req.kind, req.content)
                    .await?
            }
        };
        Ok(Envelope::with_payload(kinds::SEND_MESSAGE, &message)?)
    }

    /// Only the receiver, or a member for group messages, may move a
    /// message's status.
    async fn ack(&self, user: &UserId, req: AckRequest) -> Result<Envelope, ChatError> {
        let message = self.store.get_message(&req.message_id).await?;
        let allowed = match &message.recipient {
            Recipient::User(receiver) => receiver == user,
            Recipient::Group(group) => self.membership.is_member(group, user).await?,
        };
        if !allowed {
            warn!(user_id = %user, message_id = %req.message_id, "ack from non-recipient");
            return Err(ChatError::NotRecipient {
                message_id: req.message_id,
                user_id: user.clone(),
            });
        }

        let applied = self.store.update_status(&req.message_id, req.status).await?;
        if !applied {
            debug!(message_id = %req.message_id, status = %req.status, "ack would move status backwards");
        }
        Ok(Envelope::with_payload(
            kinds::ACK,
            &AckResponse {
                message_id: req.message_id,
                status: req.status,
                applied,
            },
        )?)
    }

    async fn sync_offline(&self, user: &UserId, req: SyncOfflineRequest) -> Result<Envelope, ChatError> {
        let page = self
            .sync
            .sync_offline(user, req.last_message_id.as_ref(), req.limit)
            .await?;
        Ok(Envelope::with_payload(
            kinds::SYNC_OFFLINE,
            &SyncOfflineResponse {
                messages: page.messages,
                has_more: page.has_more,
            },
        )?)
    }

    async fn create_group(&self, user: &UserId, req: CreateGroupRequest) -> Result<Envelope, ChatError> {
        let group = self
            .membership
            .create_group(user, &req.name, &req.description, &req.members)
            .await?;
        Ok(Envelope::with_payload(kinds::CREATE_GROUP, &group)?)
    }
}

fn require_user(session: &Session, kind: &str) -> Result<UserId, ChatError> {
    session.user().ok_or_else(|| {
        ChatError::from(ProtocolError::LoginRequired {
            kind: kind.to_owned(),
        })
    })
}

#[async_trait]
impl FrameHandler for Dispatcher {
    async fn handle_frame(&self, session: &Arc<Session>, frame: &str) {
        let envelope = match Envelope::decode(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(connection_id = %session.id(), error = %e, "undecodable frame");
                let err = ChatError::from(e);
                let _ = session.send_envelope(&Envelope::error(err.code(), err.to_string()));
                return;
            }
        };
        let reply_to = envelope.message_id.clone();

        let result = match Command::from_envelope(&envelope) {
            Ok(command) => self.dispatch(session, command).await,
            Err(e) => Err(e.into()),
        };

        let reply = match result {
            Ok(reply) => reply,
            Err(err) => {
                match &err {
                    ChatError::ClientProtocol(_) => debug!(kind = %envelope.kind, error = %err, "rejected frame"),
                    ChatError::Store(_) | ChatError::Encode(_) => error!(kind = %envelope.kind, error = %err, "command failed"),
                    _ => warn!(kind = %envelope.kind, error = %err, "command failed"),
                }
                Envelope::error(err.code(), err.to_string())
            }
        };

        if let Err(e) = session.send_envelope(&reply.reply_to(reply_to)) {
            debug!(connection_id = %session.id(), error = %e, "reply not queued");
        }
    }

    async fn on_disconnect(&self, session: &Arc<Session>) {
        let Some(user) = session.user() else { return };
        if let Err(e) = self.cache.clear_presence(&user, session.id()).await {
            warn!(user_id = %user, error = %e, "failed to clear presence");
        }
    }
}
