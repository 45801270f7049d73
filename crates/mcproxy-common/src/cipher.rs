//! Byte-stream AES-128-CFB8 cipher, applied to a session's raw TCP bytes
//! once the handshake has exchanged a shared secret.
//!
//! CFB8 operates a block cipher one byte at a time, so encryption and
//! decryption both proceed byte-by-byte over whatever's handed in rather
//! than requiring block-aligned buffers.

use aes::{cipher::generic_array::GenericArray, Aes128};
use cfb8::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};

/// A session's two independent CFB8 streams, one per direction. The key
/// and IV are both the 16-byte shared secret negotiated during the
/// handshake; client-bound and server-bound traffic run through separate
/// `Encryptor`/`Decryptor` instances so the two directions never share
/// keystream state.
pub struct SessionCipher {
    encryptor: cfb8::Encryptor<Aes128>,
    decryptor: cfb8::Decryptor<Aes128>,
}

impl SessionCipher {
    pub fn new(shared_secret: &[u8; 16]) -> Self {
        let key_iv = GenericArray::from_slice(shared_secret);
        Self {
            encryptor: cfb8::Encryptor::new(key_iv, key_iv),
            decryptor: cfb8::Decryptor::new(key_iv, key_iv),
        }
    }

    /// Encrypts `data` in place, one byte at a time.
    pub fn encrypt(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            let slice = std::slice::from_mut(byte);
            self.encryptor
                .encrypt_block_mut(GenericArray::from_mut_slice(slice));
        }
    }

    /// Decrypts `data` in place, one byte at a time.
    pub fn decrypt(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            let slice = std::slice::from_mut(byte);
            self.decryptor
                .decrypt_block_mut(GenericArray::from_mut_slice(slice));
        }
    }
}

/// Tracks whether encryption has been turned on for a session yet. Plain
/// passthrough before the handshake installs a shared secret.
pub enum CipherState {
    Plaintext,
    Encrypted(SessionCipher),
}

impl CipherState {
    pub fn encrypt(&mut self, data: &mut [u8]) {
        if let CipherState::Encrypted(cipher) = self {
            cipher.encrypt(data);
        }
    }

    pub fn decrypt(&mut self, data: &mut [u8]) {
        if let CipherState::Encrypted(cipher) = self {
            cipher.decrypt(data);
        }
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self, CipherState::Encrypted(_))
    }

    pub fn install(&mut self, shared_secret: &[u8; 16]) {
        *self = CipherState::Encrypted(SessionCipher::new(shared_secret));
    }
}

impl Default for CipherState {
    fn default() -> Self {
        CipherState::Plaintext
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cfb8_roundtrip() {
        let secret = [0x2Au8; 16];
        let mut enc = SessionCipher::new(&secret);
        let mut dec = SessionCipher::new(&secret);

        let plaintext = b"hello proxy world, this spans more than one block".to_vec();
        let mut buf = plaintext.clone();
        enc.encrypt(&mut buf);
        assert_ne!(buf, plaintext);
        dec.decrypt(&mut buf);
        assert_eq!(buf, plaintext);
    }

    #[test]
    fn test_cfb8_byte_at_a_time_matches_bulk() {
        let secret = [0x11u8; 16];
        let mut enc_bulk = SessionCipher::new(&secret);
        let mut enc_split = SessionCipher::new(&secret);

        let data = b"0123456789abcdef0123456789abcdef".to_vec();
        let mut bulk = data.clone();
        enc_bulk.encrypt(&mut bulk);

        let mut split = Vec::new();
        for chunk in data.chunks(3) {
            let mut c = chunk.to_vec();
            enc_split.encrypt(&mut c);
            split.extend_from_slice(&c);
        }

        assert_eq!(bulk, split);
    }

    #[test]
    fn test_cipher_state_plaintext_passthrough() {
        let mut state = CipherState::default();
        assert!(!state.is_encrypted());
        let mut data = vec![1, 2, 3];
        state.encrypt(&mut data);
        assert_eq!(data, vec![1, 2, 3]);
    }

    #[test]
    fn test_cipher_state_install_switches_to_encrypted() {
        let mut state = CipherState::default();
        state.install(&[0x55u8; 16]);
        assert!(state.is_encrypted());
        let original = vec![9, 8, 7, 6];
        let mut data = original.clone();
        state.encrypt(&mut data);
        assert_ne!(data, original);
    }
}
