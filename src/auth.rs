use crate::types::*;
use async_trait::async_trait;
use axum::http::HeaderMap;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub subject: UserId,
    pub raw_token: String,
}

/// Resolves the caller of a request. `Ok(None)` means "not signed in".
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn current_identity(&self, headers: &HeaderMap) -> Result<Option<Identity>>;
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

/// Fixed token table, loaded from `token:subject` pairs.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenIdentity {
    tokens: HashMap<String, UserId>,
}

impl StaticTokenIdentity {
    pub fn parse(table: &str) -> Result<Self> {
        let mut tokens = HashMap::new();
        for pair in table.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (token, subject) = match pair.split_once(':') {
                Some((t, s)) if !t.trim().is_empty() && !s.trim().is_empty() => {
                    (t.trim(), s.trim())
                }
                _ => {
                    return Err(ChatError::internal(format!(
                        "Malformed token entry '{}', expected token:subject",
                        pair
                    ))
                    .into())
                }
            };
            tokens.insert(token.to_string(), UserId::from(subject));
        }
        Ok(Self { tokens })
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl IdentityProvider for StaticTokenIdentity {
    async fn current_identity(&self, headers: &HeaderMap) -> Result<Option<Identity>> {
        let token = match bearer_token(headers) {
            Some(t) => t,
            None => return Ok(None),
        };
        Ok(self.tokens.get(token).map(|subject| Identity {
            subject: subject.clone(),
            raw_token: token.to_string(),
        }))
    }
}

/// Like [`IdentityProvider::current_identity`] but anonymous callers are an error.
pub async fn require_identity(
    provider: &dyn IdentityProvider,
    headers: &HeaderMap,
) -> Result<Identity> {
    match provider.current_identity(headers).await? {
        Some(identity) => Ok(identity),
        None => Err(ChatError::Auth("Not authenticated".into()).into()),
    }
}
