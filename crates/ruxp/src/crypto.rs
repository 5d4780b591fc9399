use chacha20poly1305::aead::generic_array::typenum::U16;
use chacha20poly1305::aead::generic_array::GenericArray;
use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce as ChaChaNonce};
use poly1305::universal_hash::KeyInit as PolyKeyInit;
use poly1305::Poly1305;
use salsa20::cipher::{KeyIvInit, StreamCipher};
use salsa20::Salsa20;
use subtle::ConstantTimeEq;

use crate::error::{Error, Result};
use crate::protocol::MAC_SIZE;

// Well-known key/nonce used before the handshake installs the session
// nonces. Pre-handshake traffic is obfuscated, not secret.
pub(crate) const INIT_CRYPTO_KEY: &[u8; 32] = b"0053A6F94C9FF24598EB3E91E4378ADD";
pub(crate) const INIT_CRYPTO_NONCE: &[u8; 24] = b"0D74DB42A91077DEB3E91E43";

pub(crate) const SALSA20_NONCE_SIZE: usize = 8;
pub(crate) const CHACHA20_NONCE_SIZE: usize = 12;

/// Selects which AEAD construction a connection uses. Both peers must
/// pick the same variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoType {
    Chacha20,
    Salsa20,
}

/// Session-nonce discipline after the handshake.
///
/// `LegacyReuse` keeps the nonce fixed at the DH shared secret for every
/// message, which is what deployed peers of this protocol family expect.
/// `IncrementPerMessage` advances the respective nonce after every
/// encrypt/decrypt; both endpoints must be configured identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NonceMode {
    #[default]
    LegacyReuse,
    IncrementPerMessage,
}

/// One direction's nonce. The low eight bytes act as a little-endian
/// counter when increment mode is on.
struct CryptoNonce {
    data: [u8; CHACHA20_NONCE_SIZE],
    size: usize,
}

impl CryptoNonce {
    fn new(size: usize, initial: &[u8]) -> CryptoNonce {
        let mut nonce = CryptoNonce {
            data: [0u8; CHACHA20_NONCE_SIZE],
            size,
        };
        nonce
            .set(initial)
            .expect("initial nonce shorter than nonce size");
        nonce
    }

    fn set(&mut self, src: &[u8]) -> Result<()> {
        if src.len() < self.size {
            return Err(Error::InvalidNonceSize(src.len(), self.size));
        }
        self.data[..self.size].copy_from_slice(&src[..self.size]);
        Ok(())
    }

    fn bytes(&self) -> &[u8] {
        &self.data[..self.size]
    }

    fn incr(&mut self) {
        let mut low = [0u8; 8];
        low.copy_from_slice(&self.data[..8]);
        let n = u64::from_le_bytes(low).wrapping_add(1);
        self.data[..8].copy_from_slice(&n.to_le_bytes());
    }
}

/// AEAD codec over the fixed `|MAC(16)|TYPE(2)|PAYLOAD|` layout.
///
/// `encrypt` consumes a plaintext packet whose first sixteen bytes are
/// scratch and returns the full wire datagram, same length, in place.
/// `decrypt` is the inverse and returns the `|TYPE|PAYLOAD|` slice.
pub trait CryptoCodec: Send {
    fn encrypt<'a>(&mut self, packet: &'a mut [u8]) -> Result<&'a [u8]>;
    fn decrypt<'a>(&mut self, packet: &'a mut [u8]) -> Result<&'a [u8]>;
    fn set_key(&mut self, key: &[u8]);
    fn set_read_nonce(&mut self, nonce: &[u8]) -> Result<()>;
    fn set_write_nonce(&mut self, nonce: &[u8]) -> Result<()>;
}

pub fn create_crypto_codec(ty: CryptoType, mode: NonceMode) -> Box<dyn CryptoCodec> {
    match ty {
        CryptoType::Chacha20 => Box::new(Chacha20Poly1305Codec::new(mode)),
        CryptoType::Salsa20 => Box::new(Salsa20Codec::new(mode)),
    }
}

/// Salsa20 stream cipher with a one-time Poly1305 key drawn from the
/// head of the same keystream. The 16-byte tag leads the datagram.
pub struct Salsa20Codec {
    key: [u8; 32],
    read_nonce: CryptoNonce,
    write_nonce: CryptoNonce,
    mode: NonceMode,
}

impl Salsa20Codec {
    pub fn new(mode: NonceMode) -> Salsa20Codec {
        let mut codec = Salsa20Codec {
            key: [0u8; 32],
            read_nonce: CryptoNonce::new(SALSA20_NONCE_SIZE, INIT_CRYPTO_NONCE),
            write_nonce: CryptoNonce::new(SALSA20_NONCE_SIZE, INIT_CRYPTO_NONCE),
            mode,
        };
        codec.set_key(INIT_CRYPTO_KEY);
        codec
    }

    fn one_time_poly_key(key: &[u8; 32], nonce: &[u8]) -> [u8; 32] {
        let mut poly_key = [0u8; 32];
        let mut cipher = Salsa20::new(key.into(), GenericArray::from_slice(nonce));
        cipher.apply_keystream(&mut poly_key);
        poly_key
    }
}

impl CryptoCodec for Salsa20Codec {
    fn encrypt<'a>(&mut self, packet: &'a mut [u8]) -> Result<&'a [u8]> {
        if packet.len() < MAC_SIZE {
            return Err(Error::PacketTooShort(packet.len()));
        }

        let nonce = self.write_nonce.bytes().to_owned();
        let mut cipher = Salsa20::new((&self.key).into(), GenericArray::from_slice(&nonce));
        cipher.apply_keystream(&mut packet[MAC_SIZE..]);

        let poly_key = Self::one_time_poly_key(&self.key, &nonce);
        let tag = Poly1305::new(GenericArray::from_slice(&poly_key))
            .compute_unpadded(&packet[MAC_SIZE..]);
        packet[..MAC_SIZE].copy_from_slice(&tag);

        if self.mode == NonceMode::IncrementPerMessage {
            self.write_nonce.incr();
        }
        Ok(packet)
    }

    fn decrypt<'a>(&mut self, packet: &'a mut [u8]) -> Result<&'a [u8]> {
        if packet.len() < MAC_SIZE {
            return Err(Error::PacketTooShort(packet.len()));
        }

        let nonce = self.read_nonce.bytes().to_owned();
        let poly_key = Self::one_time_poly_key(&self.key, &nonce);
        let tag = Poly1305::new(GenericArray::from_slice(&poly_key))
            .compute_unpadded(&packet[MAC_SIZE..]);
        if !bool::from(tag.as_slice().ct_eq(&packet[..MAC_SIZE])) {
            return Err(Error::MessageAuthFailed);
        }

        let mut cipher = Salsa20::new((&self.key).into(), GenericArray::from_slice(&nonce));
        cipher.apply_keystream(&mut packet[MAC_SIZE..]);

        if self.mode == NonceMode::IncrementPerMessage {
            self.read_nonce.incr();
        }
        Ok(&packet[MAC_SIZE..])
    }

    fn set_key(&mut self, key: &[u8]) {
        let n = key.len().min(32);
        self.key[..n].copy_from_slice(&key[..n]);
    }

    fn set_read_nonce(&mut self, nonce: &[u8]) -> Result<()> {
        self.read_nonce.set(nonce)
    }

    fn set_write_nonce(&mut self, nonce: &[u8]) -> Result<()> {
        self.write_nonce.set(nonce)
    }
}

/// ChaCha20-Poly1305 AEAD. The AEAD produces a trailing tag, so the
/// codec shifts the payload over the leading MAC slot on encrypt and the
/// wire datagram ends up as `|CIPHERTEXT|TAG(16)|`; decrypt inverts it.
pub struct Chacha20Poly1305Codec {
    aead: ChaCha20Poly1305,
    key: [u8; 32],
    read_nonce: CryptoNonce,
    write_nonce: CryptoNonce,
    mode: NonceMode,
}

impl Chacha20Poly1305Codec {
    pub fn new(mode: NonceMode) -> Chacha20Poly1305Codec {
        let mut key = [0u8; 32];
        key.copy_from_slice(INIT_CRYPTO_KEY);
        Chacha20Poly1305Codec {
            aead: ChaCha20Poly1305::new((&key).into()),
            key,
            read_nonce: CryptoNonce::new(CHACHA20_NONCE_SIZE, INIT_CRYPTO_NONCE),
            write_nonce: CryptoNonce::new(CHACHA20_NONCE_SIZE, INIT_CRYPTO_NONCE),
            mode,
        }
    }
}

impl CryptoCodec for Chacha20Poly1305Codec {
    fn encrypt<'a>(&mut self, packet: &'a mut [u8]) -> Result<&'a [u8]> {
        if packet.len() < MAC_SIZE {
            return Err(Error::PacketTooShort(packet.len()));
        }

        let body = packet.len() - MAC_SIZE;
        packet.copy_within(MAC_SIZE.., 0);

        let nonce = ChaChaNonce::from_slice(self.write_nonce.bytes());
        let tag = self
            .aead
            .encrypt_in_place_detached(nonce, b"", &mut packet[..body])
            .map_err(|_| Error::MessageAuthFailed)?;
        packet[body..].copy_from_slice(&tag);

        if self.mode == NonceMode::IncrementPerMessage {
            self.write_nonce.incr();
        }
        Ok(packet)
    }

    fn decrypt<'a>(&mut self, packet: &'a mut [u8]) -> Result<&'a [u8]> {
        if packet.len() < MAC_SIZE {
            return Err(Error::PacketTooShort(packet.len()));
        }

        let body = packet.len() - MAC_SIZE;
        let tag: GenericArray<u8, U16> = GenericArray::clone_from_slice(&packet[body..]);
        let nonce = ChaChaNonce::from_slice(self.read_nonce.bytes());
        self.aead
            .decrypt_in_place_detached(nonce, b"", &mut packet[..body], &tag)
            .map_err(|_| Error::MessageAuthFailed)?;

        if self.mode == NonceMode::IncrementPerMessage {
            self.read_nonce.incr();
        }
        Ok(&packet[..body])
    }

    fn set_key(&mut self, key: &[u8]) {
        let n = key.len().min(32);
        self.key[..n].copy_from_slice(&key[..n]);
        self.aead = ChaCha20Poly1305::new((&self.key).into());
    }

    fn set_read_nonce(&mut self, nonce: &[u8]) -> Result<()> {
        self.read_nonce.set(nonce)
    }

    fn set_write_nonce(&mut self, nonce: &[u8]) -> Result<()> {
        self.write_nonce.set(nonce)
    }
}

/// Serialize a DH shared secret into nonce space: the low eight bytes of
/// the nonce carry the secret little-endian, the rest stay zero. Wide
/// enough for either codec variant.
pub(crate) fn session_nonce(secret: u64) -> [u8; CHACHA20_NONCE_SIZE] {
    let mut nonce = [0u8; CHACHA20_NONCE_SIZE];
    nonce[..8].copy_from_slice(&secret.to_le_bytes());
    nonce
}
