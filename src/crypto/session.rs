//! Per-association session crypto.
//!
//! One ChaCha20-Poly1305 key covers both directions; the 12-byte IV is the
//! 8-byte per-packet nonce counter followed by a 4-byte direction count
//! that differs between client and server, so the two directions can never
//! collide on an IV. The replay window is consulted before any decryption
//! and updated only after the tag verifies, giving at-most-once decryption
//! per (key, nonce).

use chacha20poly1305::aead::AeadInPlace;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use zeroize::Zeroizing;

use crate::core::constants::{AEAD_IV_SIZE, SESSION_KEY_SIZE};
use crate::core::error::CryptoError;
use crate::crypto::replay::AntiReplayWindow;
use crate::wire::packet::EncryptedPacketData;

/// Session encryption state for one association.
pub struct CryptoSession {
    cipher: Option<ChaCha20Poly1305>,
    nonce: u64,
    encrypt_count: u32,
    decrypt_count: u32,
    replay: AntiReplayWindow,
}

impl Default for CryptoSession {
    fn default() -> Self {
        Self {
            cipher: None,
            nonce: 0,
            encrypt_count: u32::MAX,
            decrypt_count: u32::MAX,
            replay: AntiReplayWindow::default(),
        }
    }
}

fn build_iv(nonce: u64, count: u32) -> [u8; AEAD_IV_SIZE] {
    let mut iv = [0u8; AEAD_IV_SIZE];
    iv[..8].copy_from_slice(&nonce.to_be_bytes());
    iv[8..].copy_from_slice(&count.to_be_bytes());
    iv
}

impl CryptoSession {
    /// A keyless session; only cleartext handshake traffic can pass until
    /// [`set_key`](Self::set_key) installs the agreed key.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fix the IV direction counts for this side of the association.
    pub fn set_initial_counts(&mut self, encrypt: u32, decrypt: u32) {
        self.encrypt_count = encrypt;
        self.decrypt_count = decrypt;
    }

    /// Install the session key agreed by the handshake.
    pub fn set_key(&mut self, key: &Zeroizing<[u8; SESSION_KEY_SIZE]>) {
        self.cipher = Some(ChaCha20Poly1305::new(Key::from_slice(key.as_ref())));
    }

    /// Whether a session key has been installed.
    pub fn has_key(&self) -> bool {
        self.cipher.is_some()
    }

    /// Seal `data` in place and return the wire wrapper for it.
    pub fn encrypt(&mut self, data: &mut [u8]) -> Result<EncryptedPacketData, CryptoError> {
        let cipher = self.cipher.as_ref().ok_or(CryptoError::NoSessionKey)?;
        let nonce = self
            .nonce
            .checked_add(1)
            .ok_or(CryptoError::CounterExhaustion)?;
        self.nonce = nonce;
        let iv = build_iv(nonce, self.encrypt_count);
        let tag = cipher
            .encrypt_in_place_detached(Nonce::from_slice(&iv), &[], data)
            .map_err(|_| CryptoError::EncryptionFailed)?;
        Ok(EncryptedPacketData {
            mac: tag.into(),
            nonce,
        })
    }

    /// Open ciphertext in place.
    ///
    /// The replay check runs before the AEAD and the window is only
    /// updated once the tag verifies, so a forged tag cannot burn a nonce.
    pub fn decrypt(
        &mut self,
        wrapper: &EncryptedPacketData,
        data: &mut [u8],
    ) -> Result<(), CryptoError> {
        let cipher = self.cipher.as_ref().ok_or(CryptoError::NoSessionKey)?;
        if !self.replay.check(wrapper.nonce) {
            return Err(CryptoError::ReplayDetected);
        }
        let iv = build_iv(wrapper.nonce, self.decrypt_count);
        cipher
            .decrypt_in_place_detached(Nonce::from_slice(&iv), &[], data, (&wrapper.mac).into())
            .map_err(|_| CryptoError::DecryptionFailed)?;
        self.replay.update(wrapper.nonce);
        Ok(())
    }

    /// Drop the key and restore the initial counters.
    pub fn reset(&mut self) {
        self.cipher = None;
        self.nonce = 0;
        self.encrypt_count = u32::MAX;
        self.decrypt_count = u32::MAX;
        self.replay.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::constants::{CLIENT_INITIAL_COUNT, SERVER_INITIAL_COUNT};

    fn session_pair() -> (CryptoSession, CryptoSession) {
        let key = Zeroizing::new([42u8; SESSION_KEY_SIZE]);
        let mut client = CryptoSession::default();
        client.set_initial_counts(CLIENT_INITIAL_COUNT, SERVER_INITIAL_COUNT);
        client.set_key(&key);
        let mut server = CryptoSession::default();
        server.set_initial_counts(SERVER_INITIAL_COUNT, CLIENT_INITIAL_COUNT);
        server.set_key(&key);
        (client, server)
    }

    #[test]
    fn seal_and_open() {
        let (mut client, mut server) = session_pair();
        let mut data = b"chunk list bytes".to_vec();
        let wrapper = client.encrypt(&mut data).unwrap();
        assert_eq!(wrapper.nonce, 1);
        server.decrypt(&wrapper, &mut data).unwrap();
        assert_eq!(data, b"chunk list bytes");
    }

    #[test]
    fn replayed_nonce_rejected() {
        let (mut client, mut server) = session_pair();
        let mut data = b"once".to_vec();
        let wrapper = client.encrypt(&mut data).unwrap();
        let mut copy = data.clone();
        server.decrypt(&wrapper, &mut data).unwrap();
        assert!(matches!(
            server.decrypt(&wrapper, &mut copy),
            Err(CryptoError::ReplayDetected)
        ));
    }

    #[test]
    fn tampered_tag_does_not_burn_the_nonce() {
        let (mut client, mut server) = session_pair();
        let mut data = b"payload".to_vec();
        let wrapper = client.encrypt(&mut data).unwrap();
        let mut bad = wrapper.clone();
        bad.mac[0] ^= 1;
        let mut scratch = data.clone();
        assert!(matches!(
            server.decrypt(&bad, &mut scratch),
            Err(CryptoError::DecryptionFailed)
        ));
        // The genuine packet still opens afterwards.
        server.decrypt(&wrapper, &mut data).unwrap();
        assert_eq!(data, b"payload");
    }

    #[test]
    fn directions_do_not_share_ivs() {
        let (mut client, mut server) = session_pair();
        let mut data = b"mirror".to_vec();
        let wrapper = client.encrypt(&mut data).unwrap();
        let mut copy = data.clone();
        // Decrypting with the wrong direction count fails: the sender
        // sealed under CLIENT_INITIAL_COUNT, not SERVER_INITIAL_COUNT.
        let mut wrong = CryptoSession::default();
        wrong.set_initial_counts(CLIENT_INITIAL_COUNT, SERVER_INITIAL_COUNT);
        wrong.set_key(&Zeroizing::new([42u8; SESSION_KEY_SIZE]));
        assert!(wrong.decrypt(&wrapper, &mut copy).is_err());
        server.decrypt(&wrapper, &mut data).unwrap();
        assert_eq!(data, b"mirror");
    }

    #[test]
    fn no_key_is_an_error() {
        let mut session = CryptoSession::default();
        let mut buf = vec![0u8; 4];
        assert!(matches!(
            session.encrypt(&mut buf),
            Err(CryptoError::NoSessionKey)
        ));
    }

    #[test]
    fn reset_drops_key() {
        let (mut client, _) = session_pair();
        client.reset();
        assert!(!client.has_key());
    }
}
