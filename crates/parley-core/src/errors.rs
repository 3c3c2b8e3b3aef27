/// Client-side protocol violations. None of these are fatal to a connection.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {detail}")]
    Malformed { detail: String },
    #[error("unknown message type: {kind}")]
    UnknownType { kind: String },
    #[error("invalid {kind} payload: {detail}")]
    InvalidPayload { kind: String, detail: String },
    #[error("message needs a receiver_id or a group_id")]
    MissingRecipient,
    #[error("message cannot carry both receiver_id and group_id")]
    AmbiguousRecipient,
    #[error("{kind} requires login")]
    LoginRequired { kind: String },
    #[error("binary frames are not supported")]
    BinaryFrame,
}

impl ProtocolError {
    pub fn invalid_payload(kind: &str, detail: impl ToString) -> Self {
        Self::InvalidPayload {
            kind: kind.to_owned(),
            detail: detail.to_string(),
        }
    }
}
