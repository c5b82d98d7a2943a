//! GVK resource router.
//!
//! # Purpose
//! Turns observed-state envelopes from tenant agents into typed calls on
//! domain handlers. The dispatch table is populated at startup with
//! [`Registry::register`]; each entry converts the generic document into the
//! handler's entity type.
//!
//! # Error classes
//! - Poison ([`RouteError::is_poison`]): the envelope, inner payload or typed
//!   conversion can never succeed. The consumer acks and drops these.
//! - Transient: mapping misses and handler failures. The consumer naks these
//!   so the broker redelivers.
//!
//! Missing routing keys and unknown GVKs are not errors at all; they are
//! logged and acked.
use tether_wire::Gvk;

pub mod apply_error;
pub mod context;
pub mod mapping;
pub mod registry;
pub mod router;

pub use apply_error::{ApplyError, ApplyErrorHandler, ApplyErrorRouter, encode_error};
pub use context::{ResourceScope, UpdateContext};
pub use mapping::{MappingKey, ResourceMappings};
pub use registry::{Registry, ResourceHandler, ScopeRequirement};
pub use router::{RouteAction, RouteOutcome, Router, encode_update, poison_policy};

pub type Result<T> = std::result::Result<T, RouteError>;

#[derive(thiserror::Error, Debug)]
pub enum RouteError {
    #[error("malformed envelope")]
    MalformedEnvelope(#[source] tether_wire::Error),
    #[error("unexpected envelope kind {0:?}")]
    UnexpectedKind(tether_wire::EnvelopeKind),
    #[error("invalid routing key")]
    InvalidRoutingKey(#[source] tether_common::Error),
    #[error("malformed payload")]
    MalformedPayload(#[source] tether_wire::Error),
    #[error("cannot convert {gvk} {name:?}")]
    Conversion {
        gvk: Gvk,
        name: String,
        #[source]
        source: tether_wire::Error,
    },
    #[error("{gvk} {name:?} is environment scoped but has no namespace")]
    MissingNamespace { gvk: Gvk, name: String },
    #[error("no resource mapping for {0}")]
    MappingNotFound(MappingKey),
    #[error("resource mapping lookup failed for {key}")]
    MappingLookup {
        key: MappingKey,
        #[source]
        source: anyhow::Error,
    },
    #[error("handler for {gvk} failed")]
    Handler {
        gvk: Gvk,
        #[source]
        source: anyhow::Error,
    },
}

impl RouteError {
    /// True when redelivery can never make this message succeed.
    pub fn is_poison(&self) -> bool {
        matches!(
            self,
            RouteError::MalformedEnvelope(_)
                | RouteError::UnexpectedKind(_)
                | RouteError::InvalidRoutingKey(_)
                | RouteError::MalformedPayload(_)
                | RouteError::Conversion { .. }
                | RouteError::MissingNamespace { .. }
        )
    }
}
