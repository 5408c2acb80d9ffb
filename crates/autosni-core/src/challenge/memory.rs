use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{ChallengeStore, ChallengeStoreError, validate_token};

/// Challenge tokens kept in memory, for single-process setups and tests
#[derive(Debug, Default)]
pub struct MemoryChallengeStore {
    tokens: RwLock<HashMap<String, String>>,
}

impl MemoryChallengeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tokens currently stored
    pub async fn len(&self) -> usize {
        self.tokens.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tokens.read().await.is_empty()
    }
}

#[async_trait]
impl ChallengeStore for MemoryChallengeStore {
    async fn write(&self, token: &str, value: &str) -> Result<(), ChallengeStoreError> {
        validate_token(token)?;
        self.tokens
            .write()
            .await
            .insert(token.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, token: &str) -> Result<(), ChallengeStoreError> {
        validate_token(token)?;
        self.tokens.write().await.remove(token);
        Ok(())
    }

    async fn read(&self, token: &str) -> Result<Option<String>, ChallengeStoreError> {
        validate_token(token)?;
        Ok(self.tokens.read().await.get(token).cloned())
    }
}
