use secp256k1::{ecdsa::Signature, All, Message, PublicKey, Secp256k1, SecretKey};
use thiserror::Error;

use super::Hash;

pub const COMPRESSED_PUBLIC_KEY_SIZE: usize = 33;
pub const SIGHASH_ALL: u8 = 0x01;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("Invalid secret key")]
    InvalidSecretKey,
    #[error("Invalid signature encoding")]
    InvalidSignature,
    #[error("Invalid public key")]
    InvalidPublicKey,
}

// Single secp256k1 key used by wallets that sign pay-to-pubkey outputs
#[derive(Clone)]
pub struct KeyPair {
    secp: Secp256k1<All>,
    secret: SecretKey,
    public: PublicKey,
}

impl KeyPair {
    pub fn new() -> Self {
        let secp = Secp256k1::new();
        let (secret, public) = secp.generate_keypair(&mut rand::thread_rng());
        Self {
            secp,
            secret,
            public,
        }
    }

    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(bytes).map_err(|_| KeyError::InvalidSecretKey)?;
        let public = PublicKey::from_secret_key(&secp, &secret);
        Ok(Self {
            secp,
            secret,
            public,
        })
    }

    pub fn public_key_bytes(&self) -> [u8; COMPRESSED_PUBLIC_KEY_SIZE] {
        self.public.serialize()
    }

    /// Sign a signature hash and return the DER signature followed by the
    /// sighash type byte, ready to be pushed in a script_sig.
    pub fn sign(&self, sighash: &Hash, sighash_type: u8) -> Vec<u8> {
        let message = Message::from_digest(sighash.to_bytes());
        let signature = self.secp.sign_ecdsa_low_r(&message, &self.secret);
        let mut bytes = signature.serialize_der().to_vec();
        bytes.push(sighash_type);
        bytes
    }

    pub fn verify(&self, sighash: &Hash, signature_with_type: &[u8]) -> Result<bool, KeyError> {
        verify_ecdsa(&self.secp, &self.public, sighash, signature_with_type)
    }
}

/// Check a script_sig style signature (DER + sighash type byte) against a
/// serialized public key.
pub fn verify_signature(
    public_key: &[u8],
    sighash: &Hash,
    signature_with_type: &[u8],
) -> Result<bool, KeyError> {
    let public = PublicKey::from_slice(public_key).map_err(|_| KeyError::InvalidPublicKey)?;
    verify_ecdsa(&Secp256k1::verification_only(), &public, sighash, signature_with_type)
}

fn verify_ecdsa<C: secp256k1::Verification>(
    secp: &Secp256k1<C>,
    public: &PublicKey,
    sighash: &Hash,
    signature_with_type: &[u8],
) -> Result<bool, KeyError> {
    let (_, der) = signature_with_type
        .split_last()
        .ok_or(KeyError::InvalidSignature)?;
    let signature = Signature::from_der(der).map_err(|_| KeyError::InvalidSignature)?;
    let message = Message::from_digest(sighash.to_bytes());
    Ok(secp.verify_ecdsa(&message, &signature, public).is_ok())
}

impl Default for KeyPair {
    fn default() -> Self {
        Self::new()
    }
}
