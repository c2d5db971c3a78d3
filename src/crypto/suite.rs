//! The fixed cipher suite.
//!
//! The protocol engine only ever sees fixed-size buffers from this module:
//! a two-role key agreement (role A initiates, role B holds the static
//! identity), a keyed MAC over handshake public keys, and a KDF from the
//! agreed secret to the session key. The concrete suite is X25519 +
//! keyed BLAKE2b-256 + HKDF-SHA-256; swapping it out only means changing
//! the constants here.

use blake2::digest::consts::U32;
use blake2::digest::Mac as _;
use blake2::Blake2bMac;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::StaticSecret;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::core::constants::SESSION_KEY_SIZE;

/// Public key size for both agreement roles.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Secret key size for both agreement roles.
pub const SECRET_KEY_SIZE: usize = 32;

/// Agreed-secret size.
pub const SHARED_SECRET_SIZE: usize = 32;

/// Handshake MAC tag size.
pub const MAC_SIZE: usize = 32;

/// KDF context string for the session key.
const KDF_INFO: &[u8] = b"squall v1 session key";

type HandshakeMac = Blake2bMac<U32>;

/// An agreement public key.
pub type PublicKey = [u8; PUBLIC_KEY_SIZE];

/// An agreement secret key, zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey([u8; SECRET_KEY_SIZE]);

impl SecretKey {
    /// Wrap existing key material.
    pub fn from_bytes(bytes: [u8; SECRET_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Borrow the raw key material.
    pub fn as_bytes(&self) -> &[u8; SECRET_KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

/// The agreed secret, zeroized on drop.
pub type SharedSecret = Zeroizing<[u8; SHARED_SECRET_SIZE]>;

/// An ephemeral or static agreement keypair.
pub struct KeyPair {
    /// Public half.
    pub public: PublicKey,
    /// Secret half.
    pub secret: SecretKey,
}

fn generate_keypair() -> KeyPair {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = x25519_dalek::PublicKey::from(&secret);
    KeyPair {
        public: *public.as_bytes(),
        secret: SecretKey(secret.to_bytes()),
    }
}

/// Generate a role-A (initiating) keypair.
pub fn generate_keypair_a() -> KeyPair {
    generate_keypair()
}

/// Generate a role-B (responding) keypair.
pub fn generate_keypair_b() -> KeyPair {
    generate_keypair()
}

fn agree(secret: &SecretKey, peer_public: &PublicKey) -> SharedSecret {
    let secret = StaticSecret::from(*secret.as_bytes());
    let public = x25519_dalek::PublicKey::from(*peer_public);
    Zeroizing::new(secret.diffie_hellman(&public).to_bytes())
}

/// Role-A agreement: our role-A secret against the peer's role-B public.
pub fn agree_a(secret_a: &SecretKey, public_b: &PublicKey) -> SharedSecret {
    agree(secret_a, public_b)
}

/// Role-B agreement: our role-B secret against the peer's role-A public.
pub fn agree_b(secret_b: &SecretKey, public_a: &PublicKey) -> SharedSecret {
    agree(secret_b, public_a)
}

/// Keyed MAC over a handshake public key.
pub fn handshake_mac(key: &SharedSecret, data: &[u8]) -> [u8; MAC_SIZE] {
    let mut mac = HandshakeMac::new_from_slice(key.as_ref())
        .expect("32 bytes is a valid BLAKE2b MAC key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Constant-time verification of a handshake MAC.
pub fn handshake_mac_verify(key: &SharedSecret, data: &[u8], tag: &[u8]) -> bool {
    let mut mac = match HandshakeMac::new_from_slice(key.as_ref()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(data);
    mac.verify_slice(tag).is_ok()
}

/// Derive the session key from the agreed secret.
pub fn derive_session_key(shared: &SharedSecret) -> Zeroizing<[u8; SESSION_KEY_SIZE]> {
    let hk = Hkdf::<Sha256>::new(None, shared.as_ref());
    let mut key = Zeroizing::new([0u8; SESSION_KEY_SIZE]);
    hk.expand(KDF_INFO, key.as_mut())
        .expect("32 bytes is a valid output length for SHA-256 HKDF");
    key
}

/// A server's static role-B identity.
///
/// Clients must know the public half out of band before associating.
pub struct ServerIdentity {
    secret: SecretKey,
    public: PublicKey,
}

impl ServerIdentity {
    /// Generate a fresh identity.
    pub fn generate() -> Self {
        let pair = generate_keypair_b();
        Self {
            secret: pair.secret,
            public: pair.public,
        }
    }

    /// Rebuild an identity from stored key material.
    pub fn from_secret_key(secret: SecretKey) -> Self {
        let x = StaticSecret::from(*secret.as_bytes());
        let public = *x25519_dalek::PublicKey::from(&x).as_bytes();
        Self { secret, public }
    }

    /// The public half, to hand to clients.
    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// The secret half, to hand to a [`Listener`](crate::server::Listener).
    pub fn secret_key(&self) -> &SecretKey {
        &self.secret
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_roles_agree() {
        let a = generate_keypair_a();
        let b = generate_keypair_b();
        let shared_a = agree_a(&a.secret, &b.public);
        let shared_b = agree_b(&b.secret, &a.public);
        assert_eq!(shared_a.as_ref(), shared_b.as_ref());
    }

    #[test]
    fn mac_verifies_and_rejects_tampering() {
        let a = generate_keypair_a();
        let b = generate_keypair_b();
        let key = agree_a(&a.secret, &b.public);
        let tag = handshake_mac(&key, b"public key bytes");
        assert!(handshake_mac_verify(&key, b"public key bytes", &tag));
        assert!(!handshake_mac_verify(&key, b"other bytes", &tag));
        let mut bad = tag;
        bad[0] ^= 1;
        assert!(!handshake_mac_verify(&key, b"public key bytes", &bad));
    }

    #[test]
    fn session_keys_match_on_both_sides() {
        let a = generate_keypair_a();
        let b = generate_keypair_b();
        let key_a = derive_session_key(&agree_a(&a.secret, &b.public));
        let key_b = derive_session_key(&agree_b(&b.secret, &a.public));
        assert_eq!(key_a.as_ref(), key_b.as_ref());
    }

    #[test]
    fn identity_round_trips_through_secret_key() {
        let identity = ServerIdentity::generate();
        let rebuilt = ServerIdentity::from_secret_key(identity.secret_key().clone());
        assert_eq!(identity.public_key(), rebuilt.public_key());
    }
}
