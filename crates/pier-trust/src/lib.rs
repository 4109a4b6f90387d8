//! Trust primitives shared by the pier orchestrator and the tenant processes it spawns.
//!
//! Each tenant owns a random secret generated once at provisioning time. The
//! orchestrator hands that secret to the tenant process through its spawn
//! environment and both sides authenticate calls with [`SignedEnvelope`].

mod envelope;

pub use envelope::{
    compute_signature, now_millis, parse_signed_integer, SignedEnvelope, TrustError, HEADER_PORT,
    HEADER_SIGNATURE, HEADER_TIMESTAMP, REPLAY_WINDOW,
};

use rand::RngCore;

/// Environment variables the orchestrator sets on every tenant process.
pub mod env {
    pub const MODE: &str = "PIER_TENANT_MODE";
    pub const TENANT_ID: &str = "PIER_TENANT_ID";
    pub const TENANT_SECRET: &str = "PIER_TENANT_SECRET";
    pub const TENANT_PORT: &str = "PIER_TENANT_PORT";
    pub const TENANT_DOMAIN: &str = "PIER_TENANT_DOMAIN";
    pub const ORCHESTRATOR_URL: &str = "PIER_ORCHESTRATOR_URL";
}

/// 32 random bytes, hex encoded.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn secrets_are_unique_hex() {
        let a = generate_secret();
        let b = generate_secret();
        assert_eq!(a.len(), 64);
        assert!(a.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
