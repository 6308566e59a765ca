//! Account storage.
//!
//! Credentials are kept as salted SHA-256 digests and compared digest to
//! digest. Real password hashing belongs to whatever store replaces
//! [`MemoryAccountStore`].

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use sha2::{Digest, Sha256};
use tether_core::{Identity, Role, TetherError, UserId};

/// A registered account.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Account {
    /// Account id.
    pub user_id: UserId,
    /// Unique login name.
    pub username: String,
    /// Role bound on login.
    pub role: Role,
    digest: [u8; 32],
}

impl Account {
    /// The identity a successful login binds.
    pub fn identity(&self) -> Identity {
        Identity {
            user_id: self.user_id.clone(),
            role: self.role,
        }
    }
}

fn digest(user_id: &UserId, password: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

/// Where accounts live.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Create an account. Fails with `DuplicateKey{key=username}` when the
    /// name is taken.
    async fn register(&self, username: &str, password: &str, role: Role) -> Result<Account, TetherError>;

    /// Check credentials. Unknown names and wrong passwords are
    /// indistinguishable.
    async fn authenticate(&self, username: &str, password: &str) -> Result<Identity, TetherError>;

    /// Delete the account with `user_id`.
    async fn remove(&self, user_id: &UserId) -> Result<Account, TetherError>;

    /// Number of accounts.
    async fn count(&self) -> usize;
}

/// In-process [`AccountStore`] keyed by username.
#[derive(Debug, Default)]
pub struct MemoryAccountStore {
    by_name: DashMap<String, Account>,
}

impl MemoryAccountStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AccountStore for MemoryAccountStore {
    async fn register(&self, username: &str, password: &str, role: Role) -> Result<Account, TetherError> {
        match self.by_name.entry(username.to_owned()) {
            Entry::Occupied(_) => Err(TetherError::DuplicateKey {
                key: username.to_owned(),
            }),
            Entry::Vacant(slot) => {
                let user_id = UserId::new();
                let account = Account {
                    digest: digest(&user_id, password),
                    user_id,
                    username: username.to_owned(),
                    role,
                };
                let _ = slot.insert(account.clone());
                Ok(account)
            }
        }
    }

    async fn authenticate(&self, username: &str, password: &str) -> Result<Identity, TetherError> {
        let account = self.by_name.get(username).ok_or(TetherError::Unauthorized)?;
        if account.digest == digest(&account.user_id, password) {
            Ok(account.identity())
        } else {
            Err(TetherError::Unauthorized)
        }
    }

    async fn remove(&self, user_id: &UserId) -> Result<Account, TetherError> {
        let username = self
            .by_name
            .iter()
            .find(|entry| entry.user_id == *user_id)
            .map(|entry| entry.key().clone())
            .ok_or_else(|| TetherError::not_found(format!("account {user_id}")))?;
        self.by_name
            .remove(&username)
            .map(|(_, account)| account)
            .ok_or_else(|| TetherError::not_found(format!("account {user_id}")))
    }

    async fn count(&self) -> usize {
        self.by_name.len()
    }
}
