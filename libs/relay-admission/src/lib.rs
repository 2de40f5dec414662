pub mod config;
pub mod credential;
pub mod gate;
pub mod policy;
pub mod protocol;

pub use config::{AdmissionConfig, PrincipalConfig};
pub use credential::Credential;
pub use gate::{AdmissionGate, Authorizer, StaticAuthorizer};
pub use policy::{Decision, DenyReason, Policy};
pub use protocol::{ConnectionMetadata, Protocol};
