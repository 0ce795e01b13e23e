//! Seed-and-key unlock strategies
//!
//! The slave hands out a seed per protected resource; the master answers
//! with a key derived from it. Real projects ship the derivation as a
//! vendor algorithm, so the computation sits behind a trait and the
//! default is an openly trivial placeholder.

use crate::error::{Result, XcpError};

/// Computes the unlock key for a resource from its seed
pub trait SeedKeyStrategy: Send + Sync {
    fn compute_key(&self, resource: u8, seed: &[u8]) -> Result<Vec<u8>>;
}

/// Placeholder strategy: first four seed bytes followed by five zeros
///
/// Matches slaves that echo the seed prefix back as the key. Swap in a
/// real strategy via [`XcpClient::with_seed_key`](crate::client::XcpClient::with_seed_key)
/// for production ECUs.
#[derive(Debug, Default)]
pub struct TrivialSeedKey;

impl SeedKeyStrategy for TrivialSeedKey {
    fn compute_key(&self, _resource: u8, seed: &[u8]) -> Result<Vec<u8>> {
        if seed.len() < 4 {
            return Err(XcpError::ProtocolViolation(format!(
                "seed of {} bytes too short for key derivation",
                seed.len()
            )));
        }
        let mut key = seed[..4].to_vec();
        key.extend_from_slice(&[0u8; 5]);
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trivial_key_layout() {
        let key = TrivialSeedKey
            .compute_key(0x04, &[0xDE, 0xAD, 0xBE, 0xEF, 0x99])
            .unwrap();
        assert_eq!(key, vec![0xDE, 0xAD, 0xBE, 0xEF, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_short_seed_rejected() {
        assert!(TrivialSeedKey.compute_key(0x04, &[1, 2]).is_err());
    }
}
