//! Authorization boundary for the fan-out hub.
//!
//! # Purpose
//! The hub asks one question per subscription: may `user` perform `action` on
//! `resource`? [`Authorizer`] is that question. Two answers ship here:
//! [`PolicyAuthorizer`] evaluates static per-user permission patterns, and
//! [`RemoteAuthorizer`] delegates to the IAM service over HTTP.
//!
//! # Key invariants
//! - Permission strings follow `action:resource`, with `*` globs in the resource.
//! - Resource strings come from the builders in this crate so policies and
//!   checks agree on the format.
//!
//! # Examples
//! ```rust
//! use tether_authz::{Action, PermissionMatcher, PermissionPattern};
//!
//! let matcher = PermissionMatcher::new(vec![PermissionPattern::new(
//!     Action::ProjectRead,
//!     "project:acme/*",
//! )]);
//! assert!(matcher.allows(Action::ProjectRead, "project:acme/p1"));
//! ```
mod action;
mod authorizer;
mod errors;
mod matcher;
mod permission;
mod remote;
mod resource;

pub use action::Action;
pub use authorizer::{Authorizer, PolicyAuthorizer};
pub use errors::{AuthzError, AuthzResult};
pub use matcher::{PermissionMatcher, wildcard_match};
pub use permission::PermissionPattern;
pub use remote::RemoteAuthorizer;
pub use resource::{account_resource, cluster_resource, project_resource};
