//! Per-node session table. Tokens are minted on the node that served the
//! login or account creation and are never replicated; after a failover the
//! client re-authenticates against whichever node it lands on.

use rand::RngCore;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct SessionTable {
    tokens: HashMap<u32, [u8; 32]>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a fresh 32-byte token for the user, replacing any prior session.
    pub fn mint(&mut self, user_id: u32) -> [u8; 32] {
        let mut token = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut token);
        self.tokens.insert(user_id, token);
        token
    }

    /// Install a token minted elsewhere (the leader-assigned CreateAccount
    /// token, installed only on the node that served the call).
    pub fn install(&mut self, user_id: u32, token: [u8; 32]) {
        self.tokens.insert(user_id, token);
    }

    pub fn validate(&self, user_id: u32, token: &[u8; 32]) -> bool {
        self.tokens.get(&user_id) == Some(token)
    }

    pub fn revoke(&mut self, user_id: u32) {
        self.tokens.remove(&user_id);
    }
}
