/*
 * Artifact encryption: AES-256-CBC + PKCS#7 with an HMAC-SHA256 trailer
 *
 * SPDX-FileCopyrightText: 2026 snapvault contributors
 * SPDX-License-Identifier: Apache-2.0
 */

//! Streaming encryption of archive bytes.
//!
//! Artifact layout: `AES-256-CBC(archive) || HMAC-SHA256(iv || ciphertext)`.
//!
//! - cipher key: `SHA-256(passphrase)`
//! - mac key: `HMAC-SHA256(cipher key, "snapvault/mac/v1")`
//! - IV: 16 random bytes per artifact, stored hex-encoded in the `.iv` sidecar
//!
//! Decryption authenticates the whole file before producing any plaintext, so a
//! wrong passphrase or a modified artifact fails with a `CryptoError` rather
//! than yielding altered bytes.

use std::{
    fmt,
    fs::File,
    io::{Read, Seek, SeekFrom, Write},
    path::Path,
};

use aes::Aes256;
use cbc::cipher::{
    BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7,
    generic_array::GenericArray,
};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use tracing::debug;
use zeroize::Zeroizing;

use crate::{
    Result,
    config::Passphrase,
    error::{CryptoError, SnapshotError},
    fs_util::io_err,
};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// AES-256 key length in bytes.
pub const KEY_LEN: usize = 32;

/// CBC initialization vector length in bytes.
pub const IV_LEN: usize = 16;

/// Length of the integrity trailer.
pub const TAG_LEN: usize = 32;

const BLOCK_LEN: usize = 16;

/// Bytes processed per read; a whole number of blocks.
const CHUNK_LEN: usize = 64 * 1024;

const MAC_LABEL: &[u8] = b"snapvault/mac/v1";

/// Keys derived from a passphrase for one operation. Wiped on drop.
pub struct ArtifactKey {
    cipher: Zeroizing<[u8; KEY_LEN]>,
    mac: Zeroizing<[u8; KEY_LEN]>,
}

impl ArtifactKey {
    /// Derives the cipher key by hashing the passphrase, and a separate mac key from it.
    pub fn derive(passphrase: &Passphrase) -> Self {
        let mut cipher = Zeroizing::new([0u8; KEY_LEN]);
        Sha256::new()
            .chain_update(passphrase.expose())
            .finalize_into(GenericArray::from_mut_slice(&mut cipher[..]));
        Self::from_cipher_key(cipher)
    }

    /// Uses `bytes` as the AES-256 key directly; the mac key is derived from it.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self::from_cipher_key(Zeroizing::new(bytes))
    }

    fn from_cipher_key(cipher: Zeroizing<[u8; KEY_LEN]>) -> Self {
        let mut mac = Zeroizing::new([0u8; KEY_LEN]);
        let mut hmac = HmacSha256::new_from_slice(&cipher[..]).expect("HMAC accepts any key length");
        hmac.update(MAC_LABEL);
        mac.copy_from_slice(&hmac.finalize().into_bytes());

        Self { cipher, mac }
    }

    fn authenticator(&self, iv: &Iv) -> HmacSha256 {
        let mut hmac = HmacSha256::new_from_slice(&self.mac[..]).expect("HMAC accepts any key length");
        hmac.update(&iv.0);
        hmac
    }
}

impl fmt::Debug for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ArtifactKey(MASKED)")
    }
}

/// Per-artifact initialization vector.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Iv([u8; IV_LEN]);

impl Iv {
    /// Fresh random IV from the thread-local CSPRNG.
    pub fn random() -> Self {
        Self(rand::random())
    }

    pub const fn from_bytes(bytes: [u8; IV_LEN]) -> Self {
        Self(bytes)
    }

    /// Lowercase hex, as stored in the sidecar file.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses sidecar text; surrounding whitespace is ignored.
    pub fn from_hex(text: &str) -> Result<Self, CryptoError> {
        let bytes =
            hex::decode(text.trim()).map_err(|source| CryptoError::IvEncoding { source })?;
        let len = bytes.len();
        let bytes: [u8; IV_LEN] = bytes
            .try_into()
            .map_err(|_| CryptoError::IvLength { len })?;
        Ok(Self(bytes))
    }

    pub const fn as_bytes(&self) -> &[u8; IV_LEN] {
        &self.0
    }
}

impl fmt::Debug for Iv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Iv({})", self.to_hex())
    }
}

/// Fills `buf` from `reader` until it is full or the reader is exhausted.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

fn encrypt_blocks(enc: &mut Aes256CbcEnc, data: &mut [u8]) {
    for block in data.chunks_exact_mut(BLOCK_LEN) {
        enc.encrypt_block_mut(GenericArray::from_mut_slice(block));
    }
}

fn decrypt_blocks(dec: &mut Aes256CbcDec, data: &mut [u8]) {
    for block in data.chunks_exact_mut(BLOCK_LEN) {
        dec.decrypt_block_mut(GenericArray::from_mut_slice(block));
    }
}

fn stream_err(stage: &'static str) -> impl FnOnce(std::io::Error) -> SnapshotError {
    move |source| SnapshotError::Stream { stage, source }
}

/// Encrypts everything `reader` yields into `writer`, followed by the integrity tag.
/// Returns the number of bytes written.
pub fn encrypt_stream<R: Read, W: Write>(
    key: &ArtifactKey,
    iv: &Iv,
    mut reader: R,
    mut writer: W,
) -> Result<u64> {
    let mut enc = Aes256CbcEnc::new((&*key.cipher).into(), (&iv.0).into());
    let mut mac = key.authenticator(iv);
    let mut buf = Zeroizing::new(vec![0u8; CHUNK_LEN + BLOCK_LEN]);
    let mut written = 0u64;

    let tail = loop {
        let n = read_full(&mut reader, &mut buf[..CHUNK_LEN]).map_err(stream_err("archive"))?;
        if n < CHUNK_LEN {
            break n;
        }
        encrypt_blocks(&mut enc, &mut buf[..n]);
        mac.update(&buf[..n]);
        writer
            .write_all(&buf[..n])
            .map_err(stream_err("ciphertext"))?;
        written += n as u64;
    };

    let full = tail - tail % BLOCK_LEN;
    encrypt_blocks(&mut enc, &mut buf[..full]);
    let padded_len = enc
        .encrypt_padded_mut::<Pkcs7>(&mut buf[full..full + BLOCK_LEN], tail - full)
        .map_err(|_| CryptoError::Padding)?
        .len();
    let last = full + padded_len;
    mac.update(&buf[..last]);
    writer
        .write_all(&buf[..last])
        .map_err(stream_err("ciphertext"))?;
    written += last as u64;

    let tag = mac.finalize().into_bytes();
    writer.write_all(&tag).map_err(stream_err("ciphertext"))?;
    writer.flush().map_err(stream_err("ciphertext"))?;
    written += TAG_LEN as u64;
    debug!(bytes = written, "archive encrypted");
    Ok(written)
}

/// Authenticates and decrypts the artifact at `path` into `writer`.
/// Returns the number of plaintext bytes written.
pub fn decrypt_file<W: Write>(key: &ArtifactKey, iv: &Iv, path: &Path, mut writer: W) -> Result<u64> {
    let mut file = File::open(path).map_err(io_err(path))?;
    let len = file.metadata().map_err(io_err(path))?.len();
    let min_len = (BLOCK_LEN + TAG_LEN) as u64;
    if len < min_len || (len - TAG_LEN as u64) % BLOCK_LEN as u64 != 0 {
        return Err(CryptoError::Truncated { len }.into());
    }
    let body_len = len - TAG_LEN as u64;
    let mut buf = Zeroizing::new(vec![0u8; CHUNK_LEN]);

    // pass 1: authenticate
    let mut mac = key.authenticator(iv);
    let mut remaining = body_len;
    while remaining > 0 {
        let take = chunk_len(remaining);
        file.read_exact(&mut buf[..take]).map_err(io_err(path))?;
        mac.update(&buf[..take]);
        remaining -= take as u64;
    }
    let mut tag = [0u8; TAG_LEN];
    file.read_exact(&mut tag).map_err(io_err(path))?;
    mac.verify_slice(&tag)
        .map_err(|_| CryptoError::Authentication)?;

    // pass 2: decrypt, holding back the padded final block
    file.seek(SeekFrom::Start(0)).map_err(io_err(path))?;
    let mut dec = Aes256CbcDec::new((&*key.cipher).into(), (&iv.0).into());
    let mut remaining = body_len;
    let mut written = 0u64;
    while remaining > CHUNK_LEN as u64 {
        file.read_exact(&mut buf[..]).map_err(io_err(path))?;
        decrypt_blocks(&mut dec, &mut buf[..]);
        writer.write_all(&buf[..]).map_err(stream_err("archive"))?;
        written += CHUNK_LEN as u64;
        remaining -= CHUNK_LEN as u64;
    }
    let take = chunk_len(remaining);
    file.read_exact(&mut buf[..take]).map_err(io_err(path))?;
    let last_block = take - BLOCK_LEN;
    decrypt_blocks(&mut dec, &mut buf[..last_block]);
    writer
        .write_all(&buf[..last_block])
        .map_err(stream_err("archive"))?;
    let plain = dec
        .decrypt_padded_mut::<Pkcs7>(&mut buf[last_block..take])
        .map_err(|_| CryptoError::Padding)?;
    writer.write_all(plain).map_err(stream_err("archive"))?;
    written += (last_block + plain.len()) as u64;
    writer.flush().map_err(stream_err("archive"))?;

    debug!(artifact = %path.display(), bytes = written, "artifact decrypted");
    Ok(written)
}

fn chunk_len(remaining: u64) -> usize {
    usize::try_from(remaining).map_or(CHUNK_LEN, |n| n.min(CHUNK_LEN))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use proptest::prelude::*;

    use super::*;

    fn key(pass: &str) -> ArtifactKey {
        ArtifactKey::derive(&Passphrase::new(pass).unwrap())
    }

    fn encrypt_to_file(dir: &Path, key: &ArtifactKey, iv: &Iv, plain: &[u8]) -> std::path::PathBuf {
        let path = dir.join("artifact.zip.enc");
        let file = File::create(&path).unwrap();
        encrypt_stream(key, iv, Cursor::new(plain), file).unwrap();
        path
    }

    fn decrypt_to_vec(key: &ArtifactKey, iv: &Iv, path: &Path) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        decrypt_file(key, iv, path, &mut out)?;
        Ok(out)
    }

    #[test]
    fn round_trip_across_chunk_and_block_boundaries() {
        let temp = tempfile::tempdir().unwrap();
        let key = key("correct horse");
        let iv = Iv::random();
        for len in [0, 1, 15, 16, 17, CHUNK_LEN - 1, CHUNK_LEN, CHUNK_LEN + 1, 3 * CHUNK_LEN + 7] {
            let plain: Vec<u8> = (0..len).map(|i| (i * 31 % 251) as u8).collect();
            let path = encrypt_to_file(temp.path(), &key, &iv, &plain);
            let expected_len = (len / BLOCK_LEN + 1) * BLOCK_LEN + TAG_LEN;
            assert_eq!(
                std::fs::metadata(&path).unwrap().len(),
                expected_len as u64,
                "ciphertext length for {len}"
            );
            assert_eq!(decrypt_to_vec(&key, &iv, &path).unwrap(), plain, "len {len}");
        }
    }

    #[test]
    fn wrong_passphrase_fails_authentication() {
        let temp = tempfile::tempdir().unwrap();
        let iv = Iv::random();
        let path = encrypt_to_file(temp.path(), &key("right"), &iv, b"payroll data");
        let err = decrypt_to_vec(&key("wrong"), &iv, &path).unwrap_err();
        assert!(err.is_crypto());
        assert!(matches!(
            err,
            SnapshotError::Crypto {
                source: CryptoError::Authentication
            }
        ));
    }

    #[test]
    fn wrong_iv_and_tampering_fail() {
        let temp = tempfile::tempdir().unwrap();
        let key = key("pass");
        let iv = Iv::from_bytes([7; IV_LEN]);
        let path = encrypt_to_file(temp.path(), &key, &iv, &[42u8; 100]);

        let other_iv = Iv::from_bytes([8; IV_LEN]);
        assert!(decrypt_to_vec(&key, &other_iv, &path).unwrap_err().is_crypto());

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[3] ^= 0x01;
        std::fs::write(&path, &bytes).unwrap();
        assert!(decrypt_to_vec(&key, &iv, &path).unwrap_err().is_crypto());

        std::fs::write(&path, &bytes[..bytes.len() - 5]).unwrap();
        assert!(matches!(
            decrypt_to_vec(&key, &iv, &path).unwrap_err(),
            SnapshotError::Crypto {
                source: CryptoError::Truncated { .. }
            }
        ));
    }

    #[test]
    fn key_is_sha256_of_passphrase() {
        let key = key("abc");
        assert_eq!(
            hex::encode(*key.cipher),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_ne!(*key.cipher, *key.mac);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn any_key_and_iv_round_trip(
            key_bytes in any::<[u8; KEY_LEN]>(),
            iv_bytes in any::<[u8; IV_LEN]>(),
            plain in proptest::collection::vec(any::<u8>(), 0..2 * CHUNK_LEN + 40),
        ) {
            let temp = tempfile::tempdir().unwrap();
            let key = ArtifactKey::from_bytes(key_bytes);
            let iv = Iv::from_bytes(iv_bytes);
            let path = encrypt_to_file(temp.path(), &key, &iv, &plain);
            prop_assert_eq!(decrypt_to_vec(&key, &iv, &path).unwrap(), plain);
        }
    }

    #[test]
    fn from_bytes_matches_derived_key() {
        let derived = key("abc");
        let direct = ArtifactKey::from_bytes(*derived.cipher);
        assert_eq!(*direct.cipher, *derived.cipher);
        assert_eq!(*direct.mac, *derived.mac);
    }

    #[test]
    fn iv_hex_parsing() {
        let iv = Iv::random();
        assert_eq!(Iv::from_hex(&format!("{}\n", iv.to_hex())).unwrap(), iv);
        assert!(matches!(
            Iv::from_hex("abcd"),
            Err(CryptoError::IvLength { len: 2 })
        ));
        assert!(matches!(
            Iv::from_hex("zz"),
            Err(CryptoError::IvEncoding { .. })
        ));
        assert_ne!(Iv::random(), Iv::random());
    }
}
