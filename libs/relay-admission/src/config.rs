use serde::Deserialize;

use relay_api::TopicFilter;

use crate::protocol::Protocol;

/// `[admission]` table.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AdmissionConfig {
    /// Allowed transports. Empty = no protocol restriction.
    #[serde(default)]
    pub protocols: Vec<Protocol>,
    #[serde(default)]
    pub principals: Vec<PrincipalConfig>,
}

/// One `[[admission.principals]]` entry.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PrincipalConfig {
    pub identity: String,
    pub secret: String,
    /// Principal id reported in the policy (defaults to the identity).
    #[serde(default)]
    pub principal: Option<String>,
    /// Topic filters the principal may publish on.
    #[serde(default)]
    pub publish: Vec<TopicFilter>,
    #[serde(default = "default_disconnect_after_secs")]
    pub disconnect_after_secs: u64,
    #[serde(default = "default_refresh_after_secs")]
    pub refresh_after_secs: u64,
}

fn default_disconnect_after_secs() -> u64 {
    86_400
}
fn default_refresh_after_secs() -> u64 {
    300
}
