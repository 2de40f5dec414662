use std::fmt;

use base64::Engine;

use relay_api::RelayError;

/// Identity + secret presented once per connection. Consumed by the
/// admission decision and not kept afterwards.
#[derive(Clone)]
pub struct Credential {
    identity: String,
    secret: String,
}

impl Credential {
    pub fn new(identity: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            secret: secret.into(),
        }
    }

    /// Decode a `base64("identity:secret")` token.
    pub fn from_token(token: &str) -> Result<Self, RelayError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(token.trim())
            .map_err(|e| RelayError::format(format!("token: {e}")))?;
        let text = std::str::from_utf8(&bytes)?;
        let (identity, secret) = text
            .split_once(':')
            .ok_or_else(|| RelayError::format("token: expected 'identity:secret'"))?;
        if identity.is_empty() {
            return Err(RelayError::format("token: empty identity"));
        }
        Ok(Self::new(identity, secret))
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Compare the secret without short-circuiting on the first mismatch.
    pub fn secret_matches(&self, expected: &str) -> bool {
        constant_time_eq(self.secret.as_bytes(), expected.as_bytes())
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("identity", &self.identity)
            .field("secret", &"<redacted>")
            .finish()
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let mut diff = a.len() ^ b.len();
    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= (x ^ y) as usize;
    }
    diff == 0
}
