//! Stream cipher collaborator contract.
//!
//! The engine does not implement cryptography. It consumes a cipher
//! factory at page and record boundaries: the configured provider is asked
//! for a fresh cipher per page, keyed by an IV derived from the page
//! address. Ciphertext length always equals plaintext length; on a full
//! page only the payload region is enciphered, never the hash trailer.

/// A stateful stream cipher instance.
///
/// Instances are single-use: the log requests a new cipher per page from
/// the provider and discards it after the page is transformed.
pub trait StreamCipher: Send {
    /// Transforms a single byte of the stream.
    fn crypt(&mut self, b: u8) -> u8;

    /// Transforms a buffer in place.
    fn crypt_in_place(&mut self, buf: &mut [u8]) {
        for b in buf.iter_mut() {
            *b = self.crypt(*b);
        }
    }
}

/// Factory for per-page and per-blob cipher instances.
pub trait StreamCipherProvider: Send + Sync {
    /// Stable identifier of the provider, recorded by higher layers.
    fn id(&self) -> &str;

    /// Creates a cipher initialized with `key` and the effective `iv`.
    fn create(&self, key: &[u8], iv: u64) -> Box<dyn StreamCipher>;
}

/// Derives the effective IV for the page at `page_address`.
pub fn page_iv(basic_iv: u64, page_address: u64) -> u64 {
    hash_transform(basic_iv.wrapping_sub(page_address))
}

/// 64-bit avalanche mix applied to derived IVs so that adjacent pages get
/// unrelated keystreams.
pub fn hash_transform(mut x: u64) -> u64 {
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^= x >> 31;
    x
}

/// Reference provider generating a keystream from a xorshift generator
/// seeded by key and IV.
///
/// Not cryptographically secure; intended for tests and as a template for
/// integrating a real cipher crate.
#[derive(Debug, Default)]
pub struct XorShiftCipherProvider;

impl StreamCipherProvider for XorShiftCipherProvider {
    fn id(&self) -> &str {
        "xorshift"
    }

    fn create(&self, key: &[u8], iv: u64) -> Box<dyn StreamCipher> {
        let mut seed = hash_transform(iv);
        for chunk in key.chunks(8) {
            let mut word = [0u8; 8];
            word[..chunk.len()].copy_from_slice(chunk);
            seed = hash_transform(seed ^ u64::from_le_bytes(word));
        }
        Box::new(XorShiftCipher { state: seed.max(1), buf: 0, buffered: 0 })
    }
}

struct XorShiftCipher {
    state: u64,
    buf: u64,
    buffered: u8,
}

impl StreamCipher for XorShiftCipher {
    fn crypt(&mut self, b: u8) -> u8 {
        if self.buffered == 0 {
            let mut x = self.state;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            self.state = x;
            self.buf = x;
            self.buffered = 8;
        }
        let k = self.buf as u8;
        self.buf >>= 8;
        self.buffered -= 1;
        b ^ k
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let provider = XorShiftCipherProvider;
        let key = b"0123456789abcdef";
        let mut data: Vec<u8> = (0..=255).collect();
        let original = data.clone();

        provider.create(key, page_iv(42, 0x1000)).crypt_in_place(&mut data);
        assert_ne!(data, original, "cipher must actually transform the data");

        provider.create(key, page_iv(42, 0x1000)).crypt_in_place(&mut data);
        assert_eq!(data, original);
    }

    #[test]
    fn test_different_pages_get_different_keystreams() {
        let provider = XorShiftCipherProvider;
        let key = b"0123456789abcdef";

        let mut a = vec![0u8; 64];
        let mut b = vec![0u8; 64];
        provider.create(key, page_iv(42, 0)).crypt_in_place(&mut a);
        provider.create(key, page_iv(42, 4096)).crypt_in_place(&mut b);
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_does_not_decrypt() {
        let provider = XorShiftCipherProvider;
        let mut data = b"plaintext page".to_vec();
        provider.create(b"key-one", page_iv(7, 0)).crypt_in_place(&mut data);
        provider.create(b"key-two", page_iv(7, 0)).crypt_in_place(&mut data);
        assert_ne!(data, b"plaintext page");
    }
}
