//! RC4 keystream cipher as spoken by the bulb firmware.
//!
//! The provisioning exchange encrypts WiFi credentials under a static
//! pre-shared key with no IV, so ciphertext must be byte-for-byte
//! deterministic for a given key and plaintext. The firmware decrypts with
//! the same key. This is a vendor protocol constant, not a scheme we chose;
//! it lives behind [`crate::setup`] so a compatible replacement could be
//! swapped in without touching the handshake.

/// Applies the RC4 keystream to `data`. Encryption and decryption are the
/// same operation. `key` must be non-empty; callers validate before this.
pub fn apply(key: &[u8], data: &[u8]) -> Vec<u8> {
    assert!(!key.is_empty(), "rc4 key must not be empty");

    // Key scheduling
    let mut s: [u8; 256] = core::array::from_fn(|i| i as u8);
    let mut j: u8 = 0;
    for i in 0..256 {
        j = j.wrapping_add(s[i]).wrapping_add(key[i % key.len()]);
        s.swap(i, j as usize);
    }

    // Keystream generation
    let mut i: u8 = 0;
    let mut j: u8 = 0;
    let mut out = Vec::with_capacity(data.len());
    for &byte in data {
        i = i.wrapping_add(1);
        j = j.wrapping_add(s[i as usize]);
        s.swap(i as usize, j as usize);
        let k = s[s[i as usize].wrapping_add(s[j as usize]) as usize];
        out.push(byte ^ k);
    }
    out
}
