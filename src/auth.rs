use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;

use crate::model::{CallerIdentity, VerifiedIdentity};
use crate::store::DocumentStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    MissingToken,
    InvalidToken,
    Unavailable(String),
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::MissingToken => write!(f, "missing identity token"),
            AuthError::InvalidToken => write!(f, "invalid identity token"),
            AuthError::Unavailable(e) => write!(f, "token verifier unavailable: {e}"),
        }
    }
}

impl std::error::Error for AuthError {}

/// External identity-token verification.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<VerifiedIdentity, AuthError>;
}

/// Role/tenant lookup, queried fresh for every authorization decision.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn lookup(&self, subject_id: &str) -> Option<CallerIdentity>;
}

#[async_trait]
impl Directory for DocumentStore {
    async fn lookup(&self, subject_id: &str) -> Option<CallerIdentity> {
        self.user(subject_id).map(|u| CallerIdentity::from(&u))
    }
}

/// Fixed token table, e.g. for development and tests.
#[derive(Debug, Default)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, VerifiedIdentity>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenEntry {
    token: String,
    subject_id: String,
    #[serde(default)]
    email: Option<String>,
}

impl StaticTokenVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: &str, subject_id: &str) -> Self {
        self.tokens.insert(
            token.to_string(),
            VerifiedIdentity {
                subject_id: subject_id.to_string(),
                email: None,
            },
        );
        self
    }

    /// Load `[{"token", "subjectId", "email"?}, ...]`.
    pub fn from_file(path: &Path) -> std::io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let entries: Vec<TokenEntry> = serde_json::from_str(&text)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let tokens = entries
            .into_iter()
            .map(|e| {
                (
                    e.token,
                    VerifiedIdentity {
                        subject_id: e.subject_id,
                        email: e.email,
                    },
                )
            })
            .collect();
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
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<VerifiedIdentity, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        self.tokens.get(token).cloned().ok_or(AuthError::InvalidToken)
    }
}
