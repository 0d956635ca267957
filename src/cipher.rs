//! Dual-slot AES cipher engine.
//!
//! Each connection carries two independent AES-256-CBC key/IV slots. Rotation
//! is make-before-break: fresh material is generated into the *inactive* slot
//! and delivered to the peer, then the active index flips. The retired slot
//! keeps its material, so packets encrypted before the flip remain
//! decryptable; decryption tries the active slot first, then the other.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use aes::Aes256;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;

use crate::error::{PublisherError, Result};

type Aes256CbcEncryptor = cbc::Encryptor<Aes256>;
type Aes256CbcDecryptor = cbc::Decryptor<Aes256>;

pub const KEY_LENGTH: usize = 32;
pub const IV_LENGTH: usize = 16;

/// Key material for one cipher slot.
#[derive(Clone)]
pub struct CipherKeys {
    pub key: [u8; KEY_LENGTH],
    pub iv: [u8; IV_LENGTH],
}

impl CipherKeys {
    /// Generates cryptographically strong random key material.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LENGTH];
        let mut iv = [0u8; IV_LENGTH];
        rand::thread_rng().fill_bytes(&mut key);
        rand::thread_rng().fill_bytes(&mut iv);
        Self { key, iv }
    }
}

impl std::fmt::Debug for CipherKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material never reaches logs.
        f.write_str("CipherKeys { .. }")
    }
}

/// Two cipher slots and the active-index word.
///
/// Slot updates hold the internal mutex; the active index is a single atomic
/// read on the send path.
#[derive(Debug, Default)]
pub struct CipherEngine {
    slots: Mutex<[Option<CipherKeys>; 2]>,
    active: AtomicUsize,
}

impl CipherEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any key material has been established.
    pub fn keys_defined(&self) -> bool {
        let slots = self.slots.lock().expect("cipher slot lock");
        slots[self.active.load(Ordering::SeqCst)].is_some()
    }

    pub fn active_index(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Generates material for the active slot on first use. Returns the new
    /// material, or `None` if keys were already established.
    pub fn initialize(&self) -> Option<CipherKeys> {
        let mut slots = self.slots.lock().expect("cipher slot lock");
        let active = self.active.load(Ordering::SeqCst);
        if slots[active].is_some() {
            return None;
        }
        let keys = CipherKeys::generate();
        slots[active] = Some(keys.clone());
        Some(keys)
    }

    /// Regenerates the inactive slot and returns its index and material.
    ///
    /// The active index is untouched until [`Self::commit`], so sends between
    /// rotation and commit still use the current slot.
    pub fn rotate(&self) -> (usize, CipherKeys) {
        let mut slots = self.slots.lock().expect("cipher slot lock");
        let inactive = 1 - self.active.load(Ordering::SeqCst);
        let keys = CipherKeys::generate();
        slots[inactive] = Some(keys.clone());
        (inactive, keys)
    }

    /// Flips the active index to the most recently rotated slot.
    pub fn commit(&self) {
        let index = self.active.load(Ordering::SeqCst);
        self.active.store(1 - index, Ordering::SeqCst);
    }

    /// Installs received key material into a slot (receiver side).
    pub fn set_slot(&self, index: usize, keys: CipherKeys) {
        let mut slots = self.slots.lock().expect("cipher slot lock");
        slots[index & 1] = Some(keys);
    }

    /// Marks the given slot current (receiver side, after an acknowledged
    /// rotation).
    pub fn set_active_index(&self, index: usize) {
        self.active.store(index & 1, Ordering::SeqCst);
    }

    fn slot(&self, index: usize) -> Result<CipherKeys> {
        let slots = self.slots.lock().expect("cipher slot lock");
        slots[index]
            .clone()
            .ok_or_else(|| PublisherError::CipherFailure(format!("cipher slot {index} undefined")))
    }

    /// Encrypts with the active slot, returning the ciphertext and the slot
    /// index it was produced with.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<(Vec<u8>, usize)> {
        let index = self.active.load(Ordering::SeqCst);
        Ok((self.encrypt_with(index, plaintext)?, index))
    }

    /// Encrypts with an explicit slot.
    pub fn encrypt_with(&self, index: usize, plaintext: &[u8]) -> Result<Vec<u8>> {
        let keys = self.slot(index)?;
        let encryptor = Aes256CbcEncryptor::new_from_slices(&keys.key, &keys.iv)
            .map_err(|e| PublisherError::CipherFailure(e.to_string()))?;
        Ok(encryptor.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
    }

    /// Decrypts with an explicit slot.
    pub fn decrypt_with(&self, index: usize, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let keys = self.slot(index)?;
        let decryptor = Aes256CbcDecryptor::new_from_slices(&keys.key, &keys.iv)
            .map_err(|e| PublisherError::CipherFailure(e.to_string()))?;
        decryptor
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| PublisherError::CipherFailure("decryption failed".to_string()))
    }

    /// Decrypts trying the active slot first, then the previous one.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let active = self.active.load(Ordering::SeqCst);
        match self.decrypt_with(active, ciphertext) {
            Ok(plaintext) => Ok(plaintext),
            Err(_) => self.decrypt_with(1 - active, ciphertext),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let engine = CipherEngine::new();
        engine.initialize();

        let plaintext = b"compact measurement payload";
        let (ciphertext, index) = engine.encrypt(plaintext).expect("encrypt");
        assert_eq!(index, 0);
        assert_ne!(&ciphertext[..plaintext.len().min(ciphertext.len())], plaintext);
        assert_eq!(engine.decrypt(&ciphertext).expect("decrypt"), plaintext);
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let engine = CipherEngine::new();
        assert!(!engine.keys_defined());
        assert!(engine.initialize().is_some());
        assert!(engine.initialize().is_none());
        assert!(engine.keys_defined());
    }

    #[test]
    fn test_rotation_keeps_previous_slot_decryptable() {
        let engine = CipherEngine::new();
        engine.initialize();

        let before = engine.encrypt(b"sent before rotation").expect("encrypt").0;

        let (new_index, _keys) = engine.rotate();
        assert_eq!(new_index, 1);
        engine.commit();
        assert_eq!(engine.active_index(), 1);

        let after = engine.encrypt(b"sent after rotation").expect("encrypt").0;

        // Replayed pre-rotation packet still decrypts via the old slot.
        assert_eq!(
            engine.decrypt(&before).expect("decrypt old"),
            b"sent before rotation"
        );
        assert_eq!(
            engine.decrypt(&after).expect("decrypt new"),
            b"sent after rotation"
        );
        assert_eq!(engine.decrypt_with(0, &before).expect("slot 0"), b"sent before rotation");
        // The wrong slot can at best yield garbage, never the plaintext.
        assert_ne!(engine.decrypt_with(0, &after).ok().as_deref(), Some(&b"sent after rotation"[..]));
    }

    #[test]
    fn test_rotate_before_commit_keeps_active_slot() {
        let engine = CipherEngine::new();
        engine.initialize();
        engine.rotate();

        // Bytes scheduled between rotate and commit use the current slot.
        let (_, index) = engine.encrypt(b"in flight").expect("encrypt");
        assert_eq!(index, 0);
    }

    #[test]
    fn test_undefined_slot_errors() {
        let engine = CipherEngine::new();
        assert!(engine.encrypt(b"data").is_err());
        assert!(engine.decrypt(b"data").is_err());
    }
}
