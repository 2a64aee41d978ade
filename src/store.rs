use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error as ThisError;

use crate::token::Token;

/// The Store holds every key with the token it was set to. It is safe to share between sessions
/// and cheap to clone, since clones point at the same reference counted map.
#[derive(Clone, Default)]
pub struct Store {
    inner: Arc<RwLock<HashMap<String, Token>>>,
}

#[derive(Debug, ThisError, PartialEq)]
pub enum StoreError {
    #[error("store lock poisoned by a panicked writer")]
    Poisoned,
}

impl Store {
    pub fn new() -> Store {
        Store::default()
    }

    pub fn set(&self, key: String, value: Token) -> Result<(), StoreError> {
        let mut keys = self.inner.write().map_err(|_| StoreError::Poisoned)?;
        keys.insert(key, value);
        Ok(())
    }

    /// Returns the token stored under `key`, or a null bulk string when there is none. A miss is
    /// an ordinary answer, not an error.
    pub fn get(&self, key: &str) -> Result<Token, StoreError> {
        let keys = self.inner.read().map_err(|_| StoreError::Poisoned)?;
        Ok(keys.get(key).cloned().unwrap_or(Token::NullBulk))
    }

    /// Removes `key`, returning whether it was present. Deleting a missing key is a no-op.
    pub fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut keys = self.inner.write().map_err(|_| StoreError::Poisoned)?;
        Ok(keys.remove(key).is_some())
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        let keys = self.inner.read().map_err(|_| StoreError::Poisoned)?;
        Ok(keys.len())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        self.len().map(|len| len == 0)
    }
}
