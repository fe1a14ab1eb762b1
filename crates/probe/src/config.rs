//! Per-run configuration carried in the run's configuration blob.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::warn;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    #[default]
    None,
    Credentials,
    Token,
}

/// Every field is read on its own: a bad value drops only that field.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunConfig {
    #[serde(default, deserialize_with = "lenient")]
    pub auth_type: AuthType,
    #[serde(default, deserialize_with = "lenient")]
    pub username: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub password: Option<String>,
    /// Cookie string (`a=1; b=2`) or bearer token.
    #[serde(default, deserialize_with = "lenient")]
    pub token: Option<String>,
    /// Page holding the login form; the target itself when absent.
    #[serde(default, deserialize_with = "lenient")]
    pub login_url: Option<String>,
    /// Operator guidance forwarded to the exploration prompt.
    #[serde(default, deserialize_with = "lenient")]
    pub instructions: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub max_steps: Option<usize>,
}

fn lenient<'de, D, T>(d: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let raw = Value::deserialize(d)?;
    Ok(serde_json::from_value(raw.clone()).unwrap_or_else(|e| {
        warn!(value = %raw, error = %e, "ignoring malformed run configuration field");
        T::default()
    }))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Auth {
    Credentials { username: String, password: String, login_url: Option<String> },
    Token(String),
}

impl RunConfig {
    /// Lenient parse: a blob that is not an object degrades to an
    /// unauthenticated default.
    pub fn from_value(v: &Value) -> RunConfig {
        if v.is_null() {
            return RunConfig::default();
        }
        serde_json::from_value(v.clone()).unwrap_or_else(|e| {
            warn!(error = %e, "ignoring malformed run configuration");
            RunConfig::default()
        })
    }

    pub fn auth(&self) -> Option<Auth> {
        match self.auth_type {
            AuthType::None => None,
            AuthType::Credentials => match (&self.username, &self.password) {
                (Some(u), Some(p)) if !u.is_empty() => Some(Auth::Credentials {
                    username: u.clone(),
                    password: p.clone(),
                    login_url: self.login_url.clone(),
                }),
                _ => None,
            },
            AuthType::Token => self.token.as_ref().filter(|t| !t.trim().is_empty()).map(|t| Auth::Token(t.trim().to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn credentials_need_both_halves() {
        let cfg = RunConfig::from_value(&json!({"auth_type": "credentials", "username": "admin"}));
        assert_eq!(cfg.auth(), None);
        let cfg = RunConfig::from_value(&json!({"auth_type": "credentials", "username": "admin", "password": "pw"}));
        assert!(matches!(cfg.auth(), Some(Auth::Credentials { .. })));
    }

    #[test]
    fn malformed_blob_falls_back_to_default() {
        let cfg = RunConfig::from_value(&json!("auth=token"));
        assert_eq!(cfg.auth_type, AuthType::None);
        assert!(RunConfig::from_value(&Value::Null).auth().is_none());
    }

    #[test]
    fn bad_field_keeps_the_rest() {
        let cfg = RunConfig::from_value(&json!({"auth_type": "kerberos", "max_steps": 5, "instructions": "x"}));
        assert_eq!(cfg.auth_type, AuthType::None);
        assert_eq!(cfg.max_steps, Some(5));
        assert_eq!(cfg.instructions.as_deref(), Some("x"));

        let cfg = RunConfig::from_value(&json!({"auth_type": "token", "token": "sid=1", "max_steps": "ten"}));
        assert_eq!(cfg.max_steps, None);
        assert_eq!(cfg.auth(), Some(Auth::Token("sid=1".into())));
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let cfg = RunConfig::from_value(&json!({"auth_type": "token", "token": " sid=1 ", "theme": "dark", "max_steps": 5}));
        assert_eq!(cfg.auth(), Some(Auth::Token("sid=1".into())));
        assert_eq!(cfg.max_steps, Some(5));
    }
}
