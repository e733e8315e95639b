//! Cryptographic primitives used by the key-exchange handshake.
//!
//! - [`KeyPair`]: RSA keypair generated by the handshake initiator. Its public
//!   modulus and exponent travel in the `KeyExchangeRequest`.
//! - [`PublicKey`]: the responder's view of that public key, used to encrypt
//!   the session key and IV (PKCS#1 v1.5).
//! - [`SessionCipher`]: AES in CBC mode with PKCS#7 padding, used to seal
//!   messages into [`EncryptedEnvelope`]s and open them again.

use crate::error::WireError;
use crate::message::{decode_message, serialize_message, EncryptedEnvelope, Message};

use aes::{Aes128, Aes192, Aes256};
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use zeroize::Zeroizing;

/// AES block size, and therefore the CBC IV length.
pub const IV_LEN: usize = 16;

/// RSA keypair held by the handshake initiator.
pub struct KeyPair {
    private: RsaPrivateKey,
}

impl KeyPair {
    /// Generate a fresh keypair. Slow for large sizes; call from a blocking
    /// context.
    pub fn generate(bits: usize) -> Result<Self, WireError> {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, bits)?;
        Ok(Self { private })
    }

    /// Big-endian public modulus.
    pub fn public_modulus(&self) -> Vec<u8> {
        self.private.n().to_bytes_be()
    }

    /// Big-endian public exponent.
    pub fn public_exponent(&self) -> Vec<u8> {
        self.private.e().to_bytes_be()
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>, WireError> {
        Ok(Zeroizing::new(
            self.private.decrypt(Pkcs1v15Encrypt, ciphertext)?,
        ))
    }
}

/// A peer's RSA public key.
#[derive(Debug, Clone)]
pub struct PublicKey(RsaPublicKey);

impl PublicKey {
    /// Rebuild a public key from its big-endian modulus and exponent.
    pub fn from_components(modulus: &[u8], exponent: &[u8]) -> Result<Self, WireError> {
        let key = RsaPublicKey::new(
            BigUint::from_bytes_be(modulus),
            BigUint::from_bytes_be(exponent),
        )?;
        Ok(Self(key))
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, WireError> {
        let mut rng = rand::thread_rng();
        Ok(self.0.encrypt(&mut rng, Pkcs1v15Encrypt, plaintext)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AesVariant {
    Aes128,
    Aes192,
    Aes256,
}

impl AesVariant {
    fn for_key_len(len: usize) -> Result<Self, WireError> {
        match len {
            16 => Ok(AesVariant::Aes128),
            24 => Ok(AesVariant::Aes192),
            32 => Ok(AesVariant::Aes256),
            other => Err(WireError::Crypto(format!(
                "unsupported AES key length: {other} bytes"
            ))),
        }
    }
}

/// Symmetric cipher shared by both ends once the handshake completes.
pub struct SessionCipher {
    variant: AesVariant,
    key: Zeroizing<Vec<u8>>,
    iv: [u8; IV_LEN],
}

macro_rules! cbc_encrypt {
    ($aes:ty, $key:expr, $iv:expr, $data:expr) => {
        cbc::Encryptor::<$aes>::new_from_slices($key, $iv)
            .map_err(|e| WireError::Crypto(e.to_string()))?
            .encrypt_padded_vec_mut::<Pkcs7>($data)
    };
}

macro_rules! cbc_decrypt {
    ($aes:ty, $key:expr, $iv:expr, $data:expr) => {
        cbc::Decryptor::<$aes>::new_from_slices($key, $iv)
            .map_err(|e| WireError::Crypto(e.to_string()))?
            .decrypt_padded_vec_mut::<Pkcs7>($data)
            .map_err(|e| WireError::Crypto(e.to_string()))?
    };
}

impl SessionCipher {
    pub fn new(key: &[u8], iv: &[u8]) -> Result<Self, WireError> {
        let variant = AesVariant::for_key_len(key.len())?;
        let iv: [u8; IV_LEN] = iv
            .try_into()
            .map_err(|_| WireError::Crypto(format!("IV must be {IV_LEN} bytes, got {}", iv.len())))?;
        Ok(Self {
            variant,
            key: Zeroizing::new(key.to_vec()),
            iv,
        })
    }

    /// Generate a random key of `key_bits` (128, 192 or 256) and a random IV.
    pub fn generate(key_bits: u32) -> Result<Self, WireError> {
        if !matches!(key_bits, 128 | 192 | 256) {
            return Err(WireError::Crypto(format!(
                "unsupported symmetric key size: {key_bits} bits"
            )));
        }
        let mut rng = rand::thread_rng();
        let mut key = Zeroizing::new(vec![0u8; key_bits as usize / 8]);
        rng.fill_bytes(&mut key);
        let mut iv = [0u8; IV_LEN];
        rng.fill_bytes(&mut iv);
        Self::new(&key, &iv)
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn iv(&self) -> &[u8] {
        &self.iv
    }

    pub fn key_bits(&self) -> usize {
        self.key.len() * 8
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, WireError> {
        let out = match self.variant {
            AesVariant::Aes128 => cbc_encrypt!(Aes128, &self.key, &self.iv, plaintext),
            AesVariant::Aes192 => cbc_encrypt!(Aes192, &self.key, &self.iv, plaintext),
            AesVariant::Aes256 => cbc_encrypt!(Aes256, &self.key, &self.iv, plaintext),
        };
        Ok(out)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, WireError> {
        let out = match self.variant {
            AesVariant::Aes128 => cbc_decrypt!(Aes128, &self.key, &self.iv, ciphertext),
            AesVariant::Aes192 => cbc_decrypt!(Aes192, &self.key, &self.iv, ciphertext),
            AesVariant::Aes256 => cbc_decrypt!(Aes256, &self.key, &self.iv, ciphertext),
        };
        Ok(out)
    }

    /// Serialize and encrypt a message into an envelope.
    pub fn seal(&self, message: &Message) -> Result<EncryptedEnvelope, WireError> {
        let plain = Zeroizing::new(serialize_message(message)?);
        Ok(EncryptedEnvelope {
            payload: self.encrypt(&plain)?,
        })
    }

    /// Decrypt and deserialize the message inside an envelope.
    pub fn open(&self, envelope: &EncryptedEnvelope) -> Result<Message, WireError> {
        let plain = Zeroizing::new(self.decrypt(&envelope.payload)?);
        Ok(decode_message(&plain)?)
    }
}

impl std::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCipher")
            .field("variant", &self.variant)
            .finish_non_exhaustive()
    }
}
