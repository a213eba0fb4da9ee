//! Production Environment implementation using system time and RNG.
//!
//! `SystemEnv` is what a running node hands to the handshake and group
//! state machines.
//!
//! # Capabilities
//!
//! - Real monotonic time (`std::time::Instant`)
//! - OS cryptographic RNG (getrandom) for identities, ephemeral KEM keys and
//!   group keys
//! - Tokio async sleep for the maintenance loop

use std::time::Duration;

use pqlan_core::Environment;

/// Production environment using system time and cryptographic RNG.
///
/// # Security
///
/// Every secret the node produces (long-term signing keys, ephemeral ML-KEM
/// keys, group keys) is drawn from getrandom, i.e. the OS CSPRNG.
///
/// # Panics
///
/// Panics if the OS RNG fails. A node without working entropy cannot generate
/// keys that are safe to use, so it stops instead of continuing with weak
/// material.
#[derive(Clone, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    type Instant = std::time::Instant;

    #[allow(clippy::disallowed_methods)]
    fn now(&self) -> Self::Instant {
        std::time::Instant::now()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer)
            .expect("invariant: OS RNG failure is unrecoverable - node cannot generate keys");
    }
}
