//! Error kinds surfaced by the messaging core.

use parley_core::ids::{ConnectionId, GroupId, MessageId, UserId};
use parley_core::ProtocolError;
use parley_store::StoreError;

/// Why a connection's transport gave up.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransportReason {
    #[error("write failed")]
    WriteFailed,
    #[error("write deadline exceeded")]
    WriteTimeout,
    #[error("read failed")]
    ReadFailed,
    #[error("read deadline exceeded")]
    ReadTimeout,
    #[error("frame of {size} bytes exceeds limit of {limit}")]
    FrameTooLarge { size: usize, limit: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// Malformed or unknown frame. Answered with an error envelope.
    #[error(transparent)]
    ClientProtocol(#[from] ProtocolError),

    #[error("login rejected for {user_id}")]
    Auth { user_id: UserId },

    #[error("{user_id} is not a member of {group_id}")]
    NotMember { group_id: GroupId, user_id: UserId },

    /// Acknowledging a message addressed to someone else.
    #[error("{user_id} is not a recipient of {message_id}")]
    NotRecipient { message_id: MessageId, user_id: UserId },

    #[error("outbound queue full on {connection_id}")]
    Backpressure { connection_id: ConnectionId },

    #[error("connection {connection_id} is closed")]
    Closed { connection_id: ConnectionId },

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The socket is gone; nothing can be sent back.
    #[error("transport failure on {connection_id}: {reason}")]
    Transport {
        connection_id: ConnectionId,
        reason: TransportReason,
    },

    #[error("encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

impl ChatError {
    /// Wire code carried in error envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ClientProtocol(_) => "PROTOCOL_ERROR",
            Self::Auth { .. } => "AUTH_FAILED",
            Self::NotMember { .. } => "NOT_MEMBER",
            Self::NotRecipient { .. } => "FORBIDDEN",
            Self::Backpressure { .. } => "BACKPRESSURE",
            Self::Closed { .. } => "CONNECTION_CLOSED",
            Self::Store(StoreError::NotFound(_)) => "NOT_FOUND",
            Self::Store(_) => "STORE_ERROR",
            Self::Transport { .. } => "TRANSPORT_ERROR",
            Self::Encode(_) => "INTERNAL_ERROR",
        }
    }

    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        let conn = ConnectionId::from_raw("conn_1");
        assert_eq!(
            ChatError::from(ProtocolError::MissingRecipient).code(),
            "PROTOCOL_ERROR"
        );
        assert_eq!(
            ChatError::Auth { user_id: UserId::from_raw("u") }.code(),
            "AUTH_FAILED"
        );
        assert_eq!(
            ChatError::Backpressure { connection_id: conn.clone() }.code(),
            "BACKPRESSURE"
        );
        assert_eq!(
            ChatError::from(StoreError::NotFound("message x".into())).code(),
            "NOT_FOUND"
        );
        assert_eq!(
            ChatError::from(StoreError::Database("locked".into())).code(),
            "STORE_ERROR"
        );
        assert_eq!(ChatError::Closed { connection_id: conn }.code(), "CONNECTION_CLOSED");
        assert_eq!(
            ChatError::NotRecipient {
                message_id: MessageId::from_raw("msg_1"),
                user_id: UserId::from_raw("u")
            }
            .code(),
            "FORBIDDEN"
        );
    }

    #[test]
    fn only_transport_failures_end_the_connection() {
        let conn = ConnectionId::from_raw("conn_1");
        assert!(ChatError::Transport {
            connection_id: conn.clone(),
            reason: TransportReason::ReadTimeout
        }
        .is_fatal_to_connection());
        assert!(!ChatError::from(ProtocolError::BinaryFrame).is_fatal_to_connection());
        assert!(!ChatError::NotMember {
            group_id: GroupId::from_raw("g"),
            user_id: UserId::from_raw("u")
        }
        .is_fatal_to_connection());
        assert!(!ChatError::Backpressure { connection_id: conn }.is_fatal_to_connection());
    }

    #[test]
    fn display_carries_ids() {
        let err = ChatError::NotMember {
            group_id: GroupId::from_raw("grp_7"),
            user_id: UserId::from_raw("mallory"),
        };
        assert_eq!(err.to_string(), "mallory is not a member of grp_7");

        let err = ChatError::Transport {
            connection_id: ConnectionId::from_raw("conn_1"),
            reason: TransportReason::FrameTooLarge { size: 600, limit: 512 },
        };
        assert!(err.to_string().contains("600 bytes exceeds limit of 512"));
    }
}
