pub mod envelope;
pub mod errors;
pub mod groups;
pub mod ids;
pub mod messages;
pub mod presence;

pub use errors::ProtocolError;
