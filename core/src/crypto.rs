use crate::error::LedgerError;
use once_cell::sync::Lazy;
use secp256k1::ecdsa::Signature;
use secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};

static SECP: Lazy<Secp256k1<All>> = Lazy::new(Secp256k1::new);

/// secp256k1 keypair owning the outputs paid to [`WalletKeypair::address`].
#[derive(Clone)]
pub struct WalletKeypair {
    secret: SecretKey,
    public: PublicKey,
}

impl WalletKeypair {
    pub fn new() -> Self {
        let (secret, public) = SECP.generate_keypair(&mut rand::thread_rng());
        Self { secret, public }
    }

    /// Compact (64 byte) ECDSA signature over sha256(data).
    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        let msg = Message::from_digest(digest(data));
        SECP.sign_ecdsa(&msg, &self.secret)
            .serialize_compact()
            .to_vec()
    }

    pub fn public_hex(&self) -> String {
        hex::encode(self.public.serialize())
    }

    pub fn address(&self) -> String {
        address_from_pubkey(&self.public)
    }
}

impl Default for WalletKeypair {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WalletKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletKeypair")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

fn digest(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(data));
    out
}

/// Address = hex of the first 20 bytes of sha256(compressed pubkey).
fn address_from_pubkey(public: &PublicKey) -> String {
    let h = Sha256::digest(public.serialize());
    hex::encode(&h[..20])
}

pub fn address_from_pubkey_hex(pubkey_hex: &str) -> Result<String, LedgerError> {
    let bytes = hex::decode(pubkey_hex).map_err(|e| LedgerError::InvalidKey(e.to_string()))?;
    let public =
        PublicKey::from_slice(&bytes).map_err(|e| LedgerError::InvalidKey(e.to_string()))?;
    Ok(address_from_pubkey(&public))
}

pub fn verify_signature(pubkey_hex: &str, data: &[u8], sig_bytes: &[u8]) -> bool {
    let Ok(bytes) = hex::decode(pubkey_hex) else {
        return false;
    };
    let Ok(public) = PublicKey::from_slice(&bytes) else {
        return false;
    };
    let Ok(sig) = Signature::from_compact(sig_bytes) else {
        return false;
    };
    let msg = Message::from_digest(digest(data));
    SECP.verify_ecdsa(&msg, &sig, &public).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_roundtrip() {
        let kp = WalletKeypair::new();
        let sig = kp.sign(b"payload");
        assert!(verify_signature(&kp.public_hex(), b"payload", &sig));
        assert!(!verify_signature(&kp.public_hex(), b"other", &sig));
    }

    #[test]
    fn address_matches_pubkey() {
        let kp = WalletKeypair::new();
        let addr = address_from_pubkey_hex(&kp.public_hex()).unwrap();
        assert_eq!(addr, kp.address());
        assert_eq!(addr.len(), 40);
        assert!(address_from_pubkey_hex("zz").is_err());
    }
}
