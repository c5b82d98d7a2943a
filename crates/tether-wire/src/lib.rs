// Wire formats shared by the control plane, tenant agents, and the fan-out hub.
//
// The outer envelope is a small binary frame carrying routing keys; its payload
// is an independently versioned JSON document. Keeping the two layers apart
// lets the relay framing change without touching the JSON contract.
pub mod command;
pub mod document;
pub mod envelope;
pub mod subject;
pub mod update;

pub use command::{AgentAction, AgentCommand, RECORD_VERSION_ANNOTATION};
pub use document::{Document, Gvk, ObjectMeta};
pub use envelope::{Envelope, EnvelopeKind, FrameHeader, MAGIC, VERSION, decode_outer, encode_outer};
pub use update::{ErrorReport, ResourceStatus, ResourceUpdate, SchemaVersion};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(&'static str),
    #[error("envelope field too large: {0}")]
    FieldTooLarge(&'static str),
    #[error("failed to serialize document")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to deserialize document")]
    Deserialize(#[source] serde_json::Error),
    #[error("invalid annotation {key}: {value:?}")]
    InvalidAnnotation { key: String, value: String },
}
