mod domain;
pub mod messages;
mod publisher;

pub use domain::{Domain, TransportConfig};
pub use publisher::{Publisher, Qos, Subscriber};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("domain already created")]
    AlreadyCreated,
    #[error("domain not yet created")]
    NotYetCreated,
    #[error("participant creation failed: {0}")]
    ParticipantCreationFailed(String),
    #[error("transport resource creation failed: {0}")]
    ResourceCreationFailed(String),
    #[error("could not delete domain")]
    DeletionFailed,
}
