//! Cipher keys and shared-secret sealing
//!
//! Every connection with payload encryption holds two ChaCha20-Poly1305 key
//! pairs. The active index selects the pair used for new data packets; the
//! other pair is the previous one, kept so packets already in flight still
//! decrypt after a rotation. Snapshots are immutable and replaced whole.
//!
//! ```text
//! data packet   [flags][sequence:u64 BE][ciphertext || tag]
//! nonce         iv XOR (0u32 || sequence BE)
//! sealed blob   [nonce:12][ciphertext || tag]       (shared-secret key)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, KeyInit, Nonce};
use gateway_codec::TextEncoding;
use hkdf::Hkdf;
use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use sha2::Sha256;

use crate::error::{PublisherError, Result};

pub const KEY_SIZE: usize = 32;
pub const IV_SIZE: usize = 12;
/// Random salt prefixed to the authentication key inside a token
pub const SALT_SIZE: usize = 8;

const SEQUENCE_SIZE: usize = 8;
const NONCE_SIZE: usize = 12;
const SHARED_SECRET_SALT: &[u8] = b"gateway-shared-secret";
const SHARED_SECRET_INFO: &[u8] = b"gateway-session-key";

/// One key and IV, with the packet counter that feeds its nonces
#[derive(Clone)]
pub struct CipherKeyPair {
    key: [u8; KEY_SIZE],
    iv: [u8; IV_SIZE],
    sequence: Arc<AtomicU64>,
}

impl std::fmt::Debug for CipherKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherKeyPair")
            .field("sequence", &self.sequence.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl CipherKeyPair {
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        let mut iv = [0u8; IV_SIZE];
        let mut rng = rand::thread_rng();
        rng.fill_bytes(&mut key);
        rng.fill_bytes(&mut iv);
        Self::new(key, iv)
    }

    pub fn new(key: [u8; KEY_SIZE], iv: [u8; IV_SIZE]) -> Self {
        Self {
            key,
            iv,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn key(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    pub fn iv(&self) -> &[u8; IV_SIZE] {
        &self.iv
    }

    fn nonce(&self, sequence: u64) -> [u8; NONCE_SIZE] {
        let mut nonce = self.iv;
        for (slot, byte) in nonce[4..].iter_mut().zip(sequence.to_be_bytes()) {
            *slot ^= byte;
        }
        nonce
    }

    fn cipher(&self) -> Result<ChaCha20Poly1305> {
        ChaCha20Poly1305::new_from_slice(&self.key)
            .map_err(|e| PublisherError::crypto(format!("invalid ChaCha20Poly1305 key: {e}")))
    }

    /// Encrypts with the next sequence number: `[sequence][ciphertext||tag]`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let nonce = self.nonce(sequence);
        let ciphertext = self
            .cipher()?
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| PublisherError::crypto(format!("ChaCha20Poly1305 encryption failed: {e}")))?;

        let mut sealed = Vec::with_capacity(SEQUENCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&sequence.to_be_bytes());
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    pub fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < SEQUENCE_SIZE {
            return Err(PublisherError::crypto("ChaCha20Poly1305 data too short"));
        }
        let (sequence, ciphertext) = sealed.split_at(SEQUENCE_SIZE);
        let mut sequence_bytes = [0u8; SEQUENCE_SIZE];
        sequence_bytes.copy_from_slice(sequence);
        let nonce = self.nonce(u64::from_be_bytes(sequence_bytes));

        self.cipher()?
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|e| PublisherError::crypto(format!("ChaCha20Poly1305 decryption failed: {e}")))
    }
}

/// Immutable pair-of-pairs snapshot for one connection
#[derive(Debug, Clone)]
pub struct CipherKeys {
    pairs: [CipherKeyPair; 2],
    index: usize,
}

impl CipherKeys {
    /// Fresh random keys in both slots, slot 0 active.
    pub fn generate() -> Self {
        Self {
            pairs: [CipherKeyPair::generate(), CipherKeyPair::generate()],
            index: 0,
        }
    }

    pub fn from_pairs(pairs: [CipherKeyPair; 2], index: usize) -> Self {
        Self {
            pairs,
            index: index & 1,
        }
    }

    /// Active pair index; carried in the data packet cipher-index flag.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn active(&self) -> &CipherKeyPair {
        &self.pairs[self.index]
    }

    pub fn pair(&self, index: usize) -> &CipherKeyPair {
        &self.pairs[index & 1]
    }

    /// Next snapshot: `pair` goes into the inactive slot and becomes active.
    pub fn rotated(&self, pair: CipherKeyPair) -> Self {
        let next = 1 - self.index;
        let mut pairs = self.pairs.clone();
        pairs[next] = pair;
        Self { pairs, index: next }
    }

    /// UpdateCipherKeys body: `[index:u8]` then per pair `[len][key][len][iv]`.
    pub fn encode_update(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(1 + 2 * (4 + KEY_SIZE + 4 + IV_SIZE));
        buf.put_u8(self.index as u8);
        for pair in &self.pairs {
            buf.put_i32(KEY_SIZE as i32);
            buf.put_slice(&pair.key);
            buf.put_i32(IV_SIZE as i32);
            buf.put_slice(&pair.iv);
        }
        buf.to_vec()
    }

    pub fn decode_update(payload: &[u8]) -> Result<Self> {
        let mut buf = payload;
        if buf.remaining() < 1 {
            return Err(PublisherError::crypto("cipher key update is empty"));
        }
        let index = usize::from(buf.get_u8() & 1);

        let mut read_pair = || -> Result<CipherKeyPair> {
            let key: [u8; KEY_SIZE] = read_sized(&mut buf, "key")?;
            let iv: [u8; IV_SIZE] = read_sized(&mut buf, "iv")?;
            Ok(CipherKeyPair::new(key, iv))
        };
        let first = read_pair()?;
        let second = read_pair()?;
        Ok(Self::from_pairs([first, second], index))
    }

    /// Encrypts a data packet body with the active pair.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<(usize, Vec<u8>)> {
        Ok((self.index, self.active().encrypt(plaintext)?))
    }
}

fn read_sized<const N: usize>(buf: &mut &[u8], what: &str) -> Result<[u8; N]> {
    if buf.remaining() < 4 {
        return Err(PublisherError::crypto(format!("cipher key update truncated before {what} length")));
    }
    let length = buf.get_i32();
    if length != N as i32 || buf.remaining() < N {
        return Err(PublisherError::crypto(format!(
            "cipher key update {what} has length {length}, expected {N}"
        )));
    }
    let mut out = [0u8; N];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

/// Per-connection holder of the current snapshot
#[derive(Debug, Default)]
pub struct CipherState {
    current: RwLock<Option<Arc<CipherKeys>>>,
    rotation: Mutex<()>,
}

impl CipherState {
    pub fn snapshot(&self) -> Option<Arc<CipherKeys>> {
        self.current.read().clone()
    }

    /// Snapshot a rotation would install, without installing it.
    pub fn next_keys(&self) -> CipherKeys {
        match self.snapshot() {
            Some(keys) => keys.rotated(CipherKeyPair::generate()),
            None => CipherKeys::generate(),
        }
    }

    pub fn install(&self, keys: Arc<CipherKeys>) {
        *self.current.write() = Some(keys);
    }

    /// Computes the next snapshot, hands it to `announce` and installs it.
    ///
    /// Rotations of one connection are serialized, so the last snapshot
    /// announced to the client is always the one installed.
    pub fn rotate<F>(&self, announce: F) -> Result<Arc<CipherKeys>>
    where
        F: FnOnce(&CipherKeys) -> Result<()>,
    {
        let _rotation = self.rotation.lock();
        let keys = Arc::new(self.next_keys());
        announce(keys.as_ref())?;
        self.install(keys.clone());
        Ok(keys)
    }

    pub fn clear(&self) {
        *self.current.write() = None;
    }
}

/// Derives the symmetric key for a subscriber's shared secret.
pub fn derive_secret_key(shared_secret: &str) -> Result<[u8; KEY_SIZE]> {
    let hk = Hkdf::<Sha256>::new(Some(SHARED_SECRET_SALT), shared_secret.as_bytes());
    let mut okm = [0u8; KEY_SIZE];
    hk.expand(SHARED_SECRET_INFO, &mut okm)
        .map_err(|e| PublisherError::crypto(format!("HKDF expansion failed: {e}")))?;
    Ok(okm)
}

/// Encrypts `plaintext` under the shared secret: `[nonce][ciphertext||tag]`.
pub fn seal_with_secret(shared_secret: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
    let key = derive_secret_key(shared_secret)?;
    let cipher = ChaCha20Poly1305::new_from_slice(&key)
        .map_err(|e| PublisherError::crypto(format!("invalid ChaCha20Poly1305 key: {e}")))?;

    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| PublisherError::crypto(format!("ChaCha20Poly1305 encryption failed: {e}")))?;

    let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

pub fn open_with_secret(shared_secret: &str, sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < NONCE_SIZE {
        return Err(PublisherError::crypto("sealed data too short"));
    }
    let key = derive_secret_key(shared_secret)?;
    let cipher = ChaCha20Poly1305::new_from_slice(&key)
        .map_err(|e| PublisherError::crypto(format!("invalid ChaCha20Poly1305 key: {e}")))?;
    let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|e| PublisherError::crypto(format!("ChaCha20Poly1305 decryption failed: {e}")))
}

/// Builds the token a subscriber sends with Authenticate.
pub fn create_auth_token(shared_secret: &str, auth_key: &str, encoding: TextEncoding) -> Result<Vec<u8>> {
    let mut plaintext = vec![0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut plaintext);
    plaintext.extend_from_slice(&encoding.encode(auth_key));
    seal_with_secret(shared_secret, &plaintext)
}

/// Recovers the authentication key carried by a token.
pub fn open_auth_token(shared_secret: &str, token: &[u8], encoding: TextEncoding) -> Result<String> {
    let plaintext = open_with_secret(shared_secret, token)?;
    if plaintext.len() < SALT_SIZE {
        return Err(PublisherError::crypto("authentication token missing salt"));
    }
    Ok(encoding.decode(&plaintext[SALT_SIZE..])?)
}
