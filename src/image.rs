//! Final firmware image validation and decryption.
//!
//! The production image is distributed encrypted with AES in CBC mode and
//! without padding. Before it can be committed to a device it goes through
//! three checks:
//!
//!  1. the ciphertext must be a positive multiple of the AES block size,
//!  2. the ciphertext is decrypted in chunks into a fresh plaintext file,
//!  3. the plaintext must carry the image header magic byte at the bootloader
//!     offset.
//!
//! The plaintext lives only as long as the [`DecryptedImage`] handle that
//! owns it. Dropping the handle removes the file, so a failed validation, a
//! failed flash or a successful one all leave nothing behind.

use std::{
    fmt,
    fs::{self, File},
    io::{self, prelude::*, SeekFrom},
    path::{Path, PathBuf},
};

use aes::{Aes128, Aes192, Aes256};
use cbc::cipher::{generic_array::GenericArray, BlockDecryptMut, InvalidLength, KeyIvInit};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, trace, warn};

use crate::error::{MagicByte, ProvisionError, Result};

// =============================================================================
// Public Interface
// =============================================================================

/// AES block size in bytes.
pub const BLOCK_SIZE: u64 = 16;

/// Ciphertext is streamed through the decryptor in chunks of this size.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Offset of the second stage bootloader in a combined ESP32 image.
pub const BOOTLOADER_OFFSET: u64 = 0x1000;

/// The first byte of a valid ESP32 image header.
pub const IMAGE_MAGIC: u8 = 0xE9;

/// The pre-shared AES-CBC key and IV used to encrypt the final image.
///
/// The key length selects the cipher: 16 bytes for AES-128, 24 bytes for
/// AES-192 and 32 bytes for AES-256. The IV is always one block.
#[derive(Clone, Eq, PartialEq)]
pub struct ImageKey {
    key: Vec<u8>,
    iv: [u8; 16],
}
impl ImageKey {
    pub fn new(key: &[u8], iv: &[u8]) -> Result<Self> {
        if !matches!(key.len(), 16 | 24 | 32) {
            return Err(ProvisionError::DecryptionFailure(format!(
                "unsupported AES key length {} (expected 16, 24 or 32 bytes)",
                key.len()
            )));
        }
        if iv.len() != 16 {
            return Err(ProvisionError::DecryptionFailure(format!(
                "invalid IV length {} (expected 16 bytes)",
                iv.len()
            )));
        }
        let mut block = [0u8; 16];
        block.copy_from_slice(iv);
        Ok(ImageKey {
            key: key.to_vec(),
            iv: block,
        })
    }

    /// Key length in bits.
    pub fn bits(&self) -> usize {
        self.key.len() * 8
    }
}
impl fmt::Debug for ImageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print the secret material.
        f.debug_struct("ImageKey")
            .field("bits", &self.bits())
            .finish()
    }
}

/// An encrypted firmware image on disk whose size has been checked.
#[derive(Debug, Clone)]
pub struct EncryptedImage {
    path: PathBuf,
    len: u64,
}
impl EncryptedImage {
    /// Locate the encrypted image and check its shape.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(ProvisionError::FirmwareNotFound(path.to_path_buf()));
        }
        let len = validate_shape(path)?;
        Ok(EncryptedImage {
            path: path.to_path_buf(),
            len,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    /// Decrypt into `out_path` and validate the result.
    ///
    /// Consumes the encrypted handle: an image is decrypted at most once per
    /// run. On any failure, the partially written plaintext is removed
    /// before the error is returned.
    pub fn decrypt(self, key: &ImageKey, out_path: impl AsRef<Path>) -> Result<DecryptedImage> {
        let image = decrypt(&self.path, key, out_path)?;
        // `image` is dropped on the error path, which removes the file.
        validate_magic(image.path())?;
        info!(
            "Decrypted {} into {}",
            self.path.display(),
            image.path().display()
        );
        Ok(image)
    }
}

/// Owning handle of a plaintext image file. The file is removed when the
/// handle is dropped.
#[derive(Debug)]
pub struct DecryptedImage {
    path: PathBuf,
}
impl DecryptedImage {
    pub fn path(&self) -> &Path {
        &self.path
    }
}
impl Drop for DecryptedImage {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed plaintext image {}", self.path.display()),
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(ref e) => warn!(
                "Could not remove plaintext image {}: {}",
                self.path.display(),
                e
            ),
        }
    }
}

/// Remove a plaintext image left behind by a run that never finished, for
/// example one interrupted with `Ctrl+C` while flashing. Returns `true` when
/// a file was removed.
pub fn remove_stale_plaintext(path: impl AsRef<Path>) -> Result<bool> {
    let path = path.as_ref();
    match fs::remove_file(path) {
        Ok(()) => {
            warn!("Removed stale plaintext image {}", path.display());
            Ok(true)
        }
        Err(ref e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Check that the file at `path` can be AES-CBC ciphertext without padding,
/// returning its length.
pub fn validate_shape(path: impl AsRef<Path>) -> Result<u64> {
    let len = fs::metadata(path.as_ref())?.len();
    if len == 0 || len % BLOCK_SIZE != 0 {
        return Err(ProvisionError::InvalidCiphertextSize(len));
    }
    Ok(len)
}

/// Stream `path` through an AES-CBC decryptor into a freshly created
/// `out_path`, never holding more than one chunk in memory.
///
/// The shape of the ciphertext is checked first and nothing is written when
/// it is wrong. The returned handle owns the plaintext file.
pub fn decrypt(
    path: impl AsRef<Path>,
    key: &ImageKey,
    out_path: impl AsRef<Path>,
) -> Result<DecryptedImage> {
    let path = path.as_ref();
    let len = validate_shape(path)?;
    let mut decryptor = CbcDecryptor::new(key)?;

    let out_path = out_path.as_ref();
    if let Some(dir) = out_path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir)?;
        }
    }
    let mut input = File::open(path)?;
    // From here on the handle owns the file, any early return removes it.
    let image = DecryptedImage {
        path: out_path.to_path_buf(),
    };
    let mut output = File::create(&image.path)?;

    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[PV] 🔓 Decrypting [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes}")
            .progress_chars("=>-"),
    );

    let mut chunk = vec![0u8; CHUNK_SIZE];
    let mut done: u64 = 0;
    loop {
        let n = read_chunk(&mut input, &mut chunk)?;
        if n == 0 {
            break;
        }
        if n % BLOCK_SIZE as usize != 0 {
            // The file changed size under our feet.
            pb.abandon();
            return Err(ProvisionError::DecryptionFailure(format!(
                "ciphertext ended in the middle of a block after {} bytes",
                done + n as u64
            )));
        }
        decryptor.decrypt_blocks(&mut chunk[..n]);
        output.write_all(&chunk[..n])?;
        done += n as u64;
        trace!("{} / {} bytes decrypted", done, len);
        pb.set_position(done);
    }
    output.flush()?;
    pb.finish_and_clear();

    if done != len {
        return Err(ProvisionError::DecryptionFailure(format!(
            "expected {} bytes of ciphertext, read {}",
            len, done
        )));
    }
    Ok(image)
}

/// Check the image header magic byte at the bootloader offset.
pub fn validate_magic(path: impl AsRef<Path>) -> Result<()> {
    let mut file = File::open(path.as_ref())?;
    file.seek(SeekFrom::Start(BOOTLOADER_OFFSET))?;
    let mut byte = [0u8; 1];
    let found = match file.read(&mut byte)? {
        0 => MagicByte::Missing,
        _ => MagicByte::Found(byte[0]),
    };
    if found != MagicByte::Found(IMAGE_MAGIC) {
        return Err(ProvisionError::InvalidImageMagic {
            offset: BOOTLOADER_OFFSET,
            expected: IMAGE_MAGIC,
            found,
        });
    }
    Ok(())
}

// =============================================================================
// Private stuff
// =============================================================================

enum CbcDecryptor {
    Aes128(cbc::Decryptor<Aes128>),
    Aes192(cbc::Decryptor<Aes192>),
    Aes256(cbc::Decryptor<Aes256>),
}
impl CbcDecryptor {
    fn new(key: &ImageKey) -> Result<Self> {
        let invalid = |e: InvalidLength| ProvisionError::DecryptionFailure(format!("cipher setup: {}", e));
        Ok(match key.key.len() {
            16 => CbcDecryptor::Aes128(
                cbc::Decryptor::<Aes128>::new_from_slices(&key.key, &key.iv).map_err(invalid)?,
            ),
            24 => CbcDecryptor::Aes192(
                cbc::Decryptor::<Aes192>::new_from_slices(&key.key, &key.iv).map_err(invalid)?,
            ),
            32 => CbcDecryptor::Aes256(
                cbc::Decryptor::<Aes256>::new_from_slices(&key.key, &key.iv).map_err(invalid)?,
            ),
            n => {
                return Err(ProvisionError::DecryptionFailure(format!(
                    "unsupported AES key length {}",
                    n
                )))
            }
        })
    }

    /// Decrypt a block aligned buffer in place, carrying the CBC chain over
    /// to the next call.
    fn decrypt_blocks(&mut self, data: &mut [u8]) {
        for block in data.chunks_exact_mut(BLOCK_SIZE as usize) {
            let block = GenericArray::from_mut_slice(block);
            match self {
                CbcDecryptor::Aes128(d) => d.decrypt_block_mut(block),
                CbcDecryptor::Aes192(d) => d.decrypt_block_mut(block),
                CbcDecryptor::Aes256(d) => d.decrypt_block_mut(block),
            }
        }
    }
}

/// Fill `buf` as much as possible, returning fewer bytes only at the end of
/// the file.
fn read_chunk(input: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use cbc::cipher::BlockEncryptMut;

    const KEY: &[u8; 16] = b"0123456789abcdef";
    const KEY256: &[u8; 32] = b"0123456789abcdef0123456789abcdef";
    const IV: &[u8; 16] = b"fedcba9876543210";

    fn encrypt(key: &[u8], plain: &[u8]) -> Vec<u8> {
        let mut data = plain.to_vec();
        match key.len() {
            16 => {
                let mut enc = cbc::Encryptor::<Aes128>::new_from_slices(key, IV).unwrap();
                for block in data.chunks_exact_mut(16) {
                    enc.encrypt_block_mut(GenericArray::from_mut_slice(block));
                }
            }
            32 => {
                let mut enc = cbc::Encryptor::<Aes256>::new_from_slices(key, IV).unwrap();
                for block in data.chunks_exact_mut(16) {
                    enc.encrypt_block_mut(GenericArray::from_mut_slice(block));
                }
            }
            _ => unreachable!(),
        }
        data
    }

    /// A plaintext spanning several chunks with the magic byte in place.
    fn valid_plaintext() -> Vec<u8> {
        let mut plain: Vec<u8> = (0..(CHUNK_SIZE * 2 + 4096))
            .map(|i| (i % 251) as u8)
            .collect();
        plain[BOOTLOADER_OFFSET as usize] = IMAGE_MAGIC;
        plain
    }

    #[test]
    fn shape_rejects_empty_and_unaligned_files() {
        let dir = tempfile::tempdir().unwrap();
        for len in &[0usize, 1, 15, 17, 4095] {
            let path = dir.path().join(format!("fw-{}.enc", len));
            fs::write(&path, vec![0u8; *len]).unwrap();
            match validate_shape(&path) {
                Err(ProvisionError::InvalidCiphertextSize(n)) => assert_eq!(n, *len as u64),
                other => panic!("unexpected result for {} bytes: {:?}", len, other),
            }
        }
        let aligned = dir.path().join("aligned.enc");
        fs::write(&aligned, vec![0u8; 48]).unwrap();
        assert_eq!(validate_shape(&aligned).unwrap(), 48);
    }

    #[test]
    fn unaligned_ciphertext_is_never_decrypted() {
        let dir = tempfile::tempdir().unwrap();
        let enc = dir.path().join("fw.enc");
        let out = dir.path().join("out").join("fw.bin");
        fs::write(&enc, vec![0u8; 33]).unwrap();
        let key = ImageKey::new(KEY, IV).unwrap();
        assert!(matches!(
            decrypt(&enc, &key, &out),
            Err(ProvisionError::InvalidCiphertextSize(33))
        ));
        assert!(!out.exists());
    }

    #[test]
    fn decrypt_reproduces_the_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let plain = valid_plaintext();
        let enc = dir.path().join("fw.enc");
        fs::write(&enc, encrypt(KEY, &plain)).unwrap();
        let out = dir.path().join("work").join("fw.bin");

        let key = ImageKey::new(KEY, IV).unwrap();
        let image = decrypt(&enc, &key, &out).unwrap();
        assert_eq!(fs::read(image.path()).unwrap(), plain);
    }

    #[test]
    fn aes256_keys_are_supported() {
        let dir = tempfile::tempdir().unwrap();
        let plain = valid_plaintext();
        let enc = dir.path().join("fw.enc");
        fs::write(&enc, encrypt(KEY256, &plain)).unwrap();

        let key = ImageKey::new(KEY256, IV).unwrap();
        assert_eq!(key.bits(), 256);
        let image = EncryptedImage::open(&enc)
            .unwrap()
            .decrypt(&key, dir.path().join("fw.bin"))
            .unwrap();
        assert_eq!(fs::read(image.path()).unwrap(), plain);
    }

    #[test]
    fn decrypted_image_is_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let enc = dir.path().join("fw.enc");
        fs::write(&enc, encrypt(KEY, &valid_plaintext())).unwrap();
        let out = dir.path().join("fw.bin");

        let key = ImageKey::new(KEY, IV).unwrap();
        let image = EncryptedImage::open(&enc).unwrap().decrypt(&key, &out).unwrap();
        assert!(out.exists());
        drop(image);
        assert!(!out.exists());
    }

    #[test]
    fn bad_magic_fails_and_removes_the_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let mut plain = valid_plaintext();
        plain[BOOTLOADER_OFFSET as usize] = 0x00;
        let enc = dir.path().join("fw.enc");
        fs::write(&enc, encrypt(KEY, &plain)).unwrap();
        let out = dir.path().join("fw.bin");

        let key = ImageKey::new(KEY, IV).unwrap();
        match EncryptedImage::open(&enc).unwrap().decrypt(&key, &out) {
            Err(ProvisionError::InvalidImageMagic { found, .. }) => {
                assert_eq!(found, MagicByte::Found(0x00))
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(!out.exists());
    }

    #[test]
    fn wrong_key_fails_magic_validation() {
        let dir = tempfile::tempdir().unwrap();
        let enc = dir.path().join("fw.enc");
        fs::write(&enc, encrypt(KEY, &valid_plaintext())).unwrap();
        let out = dir.path().join("fw.bin");

        let key = ImageKey::new(b"not-the-real-key", IV).unwrap();
        let result = EncryptedImage::open(&enc).unwrap().decrypt(&key, &out);
        assert!(matches!(
            result,
            Err(ProvisionError::InvalidImageMagic { .. })
        ));
        assert!(!out.exists());
    }

    #[test]
    fn stale_plaintext_is_removed_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("firmware-combined-decrypted.bin");
        fs::write(&path, valid_plaintext()).unwrap();

        assert!(remove_stale_plaintext(&path).unwrap());
        assert!(!path.exists());
        assert!(!remove_stale_plaintext(&path).unwrap());
    }

    #[test]
    fn short_image_reports_missing_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.bin");
        fs::write(&path, vec![IMAGE_MAGIC; 64]).unwrap();
        match validate_magic(&path) {
            Err(ProvisionError::InvalidImageMagic { found, .. }) => {
                assert_eq!(found, MagicByte::Missing)
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn missing_encrypted_image_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.enc");
        assert!(matches!(
            EncryptedImage::open(&path),
            Err(ProvisionError::FirmwareNotFound(p)) if p == path
        ));
    }

    #[test]
    fn key_lengths_are_checked() {
        assert!(ImageKey::new(b"short", IV).is_err());
        assert!(ImageKey::new(KEY, b"short-iv").is_err());
        assert_eq!(ImageKey::new(KEY, IV).unwrap().bits(), 128);
    }

    #[test]
    fn key_debug_hides_the_secret() {
        let key = ImageKey::new(KEY, IV).unwrap();
        let text = format!("{:?}", key);
        assert!(!text.contains("0123456789abcdef"));
    }
}
