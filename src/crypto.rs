//! LAN payload encryption and decryption logic.
//! Derives the per-device AES-128-CBC key/IV pair from the device token.

use crate::error::{MiotError, Result};
use aes::Aes128;
use cipher::block_padding::Pkcs7;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use md5::{Digest, Md5};

type Encryptor = cbc::Encryptor<Aes128>;
type Decryptor = cbc::Decryptor<Aes128>;

/// Length of a raw device token in bytes.
pub const TOKEN_LEN: usize = 16;

/// MD5 digest of the concatenated inputs.
pub fn md5(parts: &[&[u8]]) -> [u8; 16] {
    let mut hasher = Md5::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// LanCipher holds the token together with the key/IV pair derived from it.
///
/// `key = md5(token)`, `iv = md5(key || token)`.
#[derive(Clone)]
pub struct LanCipher {
    token: [u8; TOKEN_LEN],
    key: [u8; 16],
    iv: [u8; 16],
}

impl std::fmt::Debug for LanCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LanCipher").finish_non_exhaustive()
    }
}

impl LanCipher {
    /// Create a cipher from a raw 16-byte token.
    pub fn new(token: &[u8]) -> Result<Self> {
        let token: [u8; TOKEN_LEN] = token
            .try_into()
            .map_err(|_| MiotError::InvalidParams("token must be 16 bytes".into()))?;
        let key = md5(&[&token[..]]);
        let iv = md5(&[&key[..], &token[..]]);
        Ok(Self { token, key, iv })
    }

    /// Create a cipher from the 32 character hex form used in device catalogs.
    pub fn from_hex(token: &str) -> Result<Self> {
        if token.len() != TOKEN_LEN * 2 {
            return Err(MiotError::InvalidParams(format!(
                "token must be {} hex chars",
                TOKEN_LEN * 2
            )));
        }
        let raw = hex::decode(token).map_err(|e| MiotError::InvalidParams(e.to_string()))?;
        Self::new(&raw)
    }

    pub fn token(&self) -> &[u8; TOKEN_LEN] {
        &self.token
    }

    /// Encrypt data with PKCS7 padding.
    pub fn encrypt(&self, data: &[u8]) -> Vec<u8> {
        Encryptor::new(&self.key.into(), &self.iv.into()).encrypt_padded_vec_mut::<Pkcs7>(data)
    }

    /// Decrypt data and strip PKCS7 padding and any trailing NUL bytes.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.is_empty() || !data.len().is_multiple_of(16) {
            return Err(MiotError::MalformedFrame(format!(
                "ciphertext length {} is not a block multiple",
                data.len()
            )));
        }
        let mut plaintext = Decryptor::new(&self.key.into(), &self.iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(data)
            .map_err(|_| MiotError::MalformedFrame("bad padding".into()))?;

        // Some firmware appends NUL bytes after the JSON body
        while plaintext.last() == Some(&0) {
            plaintext.pop();
        }
        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN: &str = "00112233445566778899aabbccddeeff";

    #[test]
    fn decrypt_inverts_encrypt() {
        let cipher = LanCipher::from_hex(TOKEN).unwrap();
        let texts: [&[u8]; 4] = [b"", b"{}", b"{\"id\":1,\"method\":\"get_properties\"}", &[7u8; 48]];
        for text in texts {
            let encrypted = cipher.encrypt(text);
            assert_eq!(encrypted.len() % 16, 0);
            assert!(encrypted.len() > text.len());
            assert_eq!(cipher.decrypt(&encrypted).unwrap(), text);
        }
    }

    #[test]
    fn key_and_iv_follow_token() {
        let a = LanCipher::from_hex(TOKEN).unwrap();
        let b = LanCipher::from_hex("ffeeddccbbaa99887766554433221100").unwrap();
        assert_eq!(a.key, md5(&[&a.token()[..]]));
        assert_eq!(a.iv, md5(&[&a.key[..], &a.token()[..]]));
        assert_ne!(a.encrypt(b"same"), b.encrypt(b"same"));
    }

    #[test]
    fn trailing_nuls_are_stripped() {
        let cipher = LanCipher::from_hex(TOKEN).unwrap();
        let encrypted = cipher.encrypt(b"{\"a\":1}\0\0\0");
        assert_eq!(cipher.decrypt(&encrypted).unwrap(), b"{\"a\":1}");
    }

    #[test]
    fn rejects_bad_tokens_and_lengths() {
        assert!(LanCipher::from_hex("abcd").is_err());
        assert!(LanCipher::from_hex("zz112233445566778899aabbccddeeff").is_err());
        let cipher = LanCipher::from_hex(TOKEN).unwrap();
        assert!(cipher.decrypt(&[1, 2, 3]).is_err());
        assert!(cipher.decrypt(&[]).is_err());
    }
}
