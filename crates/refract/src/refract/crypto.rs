use aes::{
    Aes128,
    cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, generic_array::GenericArray},
};
use num_bigint::BigInt;
use rand::{RngExt, rng};
use rsa::{
    Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey,
    pkcs1v15::{Signature, SigningKey, VerifyingKey},
    pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePublicKey},
    rand_core::OsRng,
    signature::{SignatureEncoding, Signer, Verifier},
};
use sha1::{Digest, Sha1};
use sha2::Sha256;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("rsa: {0}")]
    Rsa(#[from] rsa::Error),
    #[error("public key encoding: {0}")]
    PublicKey(#[from] rsa::pkcs8::spki::Error),
    #[error("private key encoding: {0}")]
    PrivateKey(#[from] rsa::pkcs8::Error),
    #[error("signature: {0}")]
    Signature(#[from] rsa::signature::Error),
    #[error("shared secret must be 16 bytes, got {0}")]
    SecretLength(usize),
}

type Aes128Cfb8Enc = cfb8::Encryptor<Aes128>;
type Aes128Cfb8Dec = cfb8::Decryptor<Aes128>;

/// AES-128-CFB8 with key == IV, the way both legs negotiate it.
pub struct Encryptor(Aes128Cfb8Enc);

impl Encryptor {
    pub fn new(key: &[u8; 16]) -> Self {
        Self(Aes128Cfb8Enc::new(
            GenericArray::from_slice(key),
            GenericArray::from_slice(key),
        ))
    }

    pub fn apply(&mut self, buf: &mut [u8]) {
        for b in buf.chunks_exact_mut(1) {
            self.0.encrypt_block_mut(GenericArray::from_mut_slice(b));
        }
    }
}

pub struct Decryptor(Aes128Cfb8Dec);

impl Decryptor {
    pub fn new(key: &[u8; 16]) -> Self {
        Self(Aes128Cfb8Dec::new(
            GenericArray::from_slice(key),
            GenericArray::from_slice(key),
        ))
    }

    pub fn apply(&mut self, buf: &mut [u8]) {
        for b in buf.chunks_exact_mut(1) {
            self.0.decrypt_block_mut(GenericArray::from_mut_slice(b));
        }
    }
}

pub fn shared_secret_from(bytes: &[u8]) -> Result<[u8; 16], CryptoError> {
    bytes
        .try_into()
        .map_err(|_| CryptoError::SecretLength(bytes.len()))
}

pub fn random_secret() -> [u8; 16] {
    rng().random::<[u8; 16]>()
}

pub fn random_verify_token() -> [u8; 4] {
    rng().random::<[u8; 4]>()
}

pub fn random_salt() -> i64 {
    rng().random::<i64>()
}

/// Session-server hash: SHA-1 over id, secret and key, printed as a signed hex integer.
pub fn server_hash(server_id: &str, secret: &[u8], public_key_der: &[u8]) -> String {
    let mut h = Sha1::new();
    h.update(server_id.as_bytes());
    h.update(secret);
    h.update(public_key_der);
    let digest = h.finalize();
    BigInt::from_signed_bytes_be(&digest).to_str_radix(16)
}

/// Keypair the proxy presents to clients when it runs in online mode.
pub struct ProxyKeyPair {
    private: RsaPrivateKey,
    public_der: Vec<u8>,
}

impl ProxyKeyPair {
    pub fn generate() -> Result<Self, CryptoError> {
        let private = RsaPrivateKey::new(&mut OsRng, 1024)?;
        let public_der = private.to_public_key().to_public_key_der()?.as_bytes().to_vec();
        Ok(Self {
            private,
            public_der,
        })
    }

    pub fn public_der(&self) -> &[u8] {
        &self.public_der
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(self.private.decrypt(Pkcs1v15Encrypt, data)?)
    }
}

pub fn encrypt_for(public_key_der: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let key = RsaPublicKey::from_public_key_der(public_key_der)?;
    Ok(key.encrypt(&mut OsRng, Pkcs1v15Encrypt, data)?)
}

/// Checks a 1.19 client's `nonce ‖ salt` signature against the key from its login hello.
pub fn verify_signed_nonce(
    public_key_der: &[u8],
    nonce: &[u8],
    salt: i64,
    signature: &[u8],
) -> Result<bool, CryptoError> {
    let key = VerifyingKey::<Sha256>::new(RsaPublicKey::from_public_key_der(public_key_der)?);
    let Ok(sig) = Signature::try_from(signature) else {
        return Ok(false);
    };
    let mut data = Vec::with_capacity(nonce.len() + 8);
    data.extend_from_slice(nonce);
    data.extend_from_slice(&salt.to_be_bytes());
    Ok(key.verify(&data, &sig).is_ok())
}

/// A player's long-term chat key as handed out by the account service.
#[derive(Clone)]
pub struct PlayerKey {
    signer: SigningKey<Sha256>,
    pub public_der: Vec<u8>,
    pub expires_at_ms: i64,
    pub key_signature: Vec<u8>,
}

impl std::fmt::Debug for PlayerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlayerKey")
            .field("expires_at_ms", &self.expires_at_ms)
            .finish_non_exhaustive()
    }
}

impl PlayerKey {
    pub fn new(
        private: RsaPrivateKey,
        expires_at_ms: i64,
        key_signature: Vec<u8>,
    ) -> Result<Self, CryptoError> {
        let public_der = private.to_public_key().to_public_key_der()?.as_bytes().to_vec();
        Ok(Self {
            signer: SigningKey::<Sha256>::new(private),
            public_der,
            expires_at_ms,
            key_signature,
        })
    }

    pub fn from_pkcs8_pem(
        pem: &str,
        expires_at_ms: i64,
        key_signature: Vec<u8>,
    ) -> Result<Self, CryptoError> {
        let private = RsaPrivateKey::from_pkcs8_pem(pem)?;
        Self::new(private, expires_at_ms, key_signature)
    }

    /// SHA256withRSA (PKCS#1 v1.5).
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(self.signer.try_sign(data)?.to_vec())
    }

    /// Signature over `nonce ‖ salt` for the 1.19 encryption response.
    pub fn sign_nonce(&self, nonce: &[u8], salt: i64) -> Result<Vec<u8>, CryptoError> {
        let mut data = Vec::with_capacity(nonce.len() + 8);
        data.extend_from_slice(nonce);
        data.extend_from_slice(&salt.to_be_bytes());
        self.sign(&data)
    }
}
