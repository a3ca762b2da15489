//! AES-128-CBC segment decryption.
//!
//! Encrypted streams carry one key for the whole playlist; the key is
//! fetched lazily on the first encrypted segment and exactly once, however
//! many segments race for it. When the playlist gives no explicit IV, the
//! IV is the segment's media sequence number (`playlist media_sequence +
//! segment index`) as a 16-byte big-endian integer, per the HLS spec.
//!
//! Decryption is raw block-level CBC without padding removal: TS segments
//! are padded to the block size by the packager and the trailing packets
//! are already packet-aligned, so stripping would corrupt the stream.

use aes::cipher::block_padding::NoPadding;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use tokio::sync::OnceCell;
use tracing::debug;
use url::Url;

use super::transfer::{CancelFlag, HttpFetcher, TransferUnit};
use super::{CryptoError, DownloadError, PlaylistError};

type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;

const BLOCK: usize = 16;

/// Per-playlist decryption state.
#[derive(Debug)]
pub struct DecryptionContext {
    key_url: Url,
    media_sequence: u64,
    key: OnceCell<[u8; 16]>,
}

impl DecryptionContext {
    #[must_use]
    pub fn new(key_url: Url, media_sequence: u64) -> Self {
        Self {
            key_url,
            media_sequence,
            key: OnceCell::new(),
        }
    }

    /// Derives the IV for a segment without an explicit playlist IV.
    #[must_use]
    pub fn derive_iv(&self, segment_index: u64) -> [u8; 16] {
        let mut iv = [0u8; 16];
        iv[8..].copy_from_slice(&(self.media_sequence + segment_index).to_be_bytes());
        iv
    }

    /// Returns the playlist key, fetching it on first use.
    ///
    /// Concurrent callers share one in-flight fetch; a failed fetch is
    /// fatal for the book, so it is not retried here beyond the fetcher's
    /// own retry policy.
    ///
    /// # Errors
    ///
    /// Returns [`PlaylistError::KeyUnavailable`] when the key cannot be
    /// fetched, or a key-length [`CryptoError`] via the same channel.
    pub async fn key(&self, fetcher: &HttpFetcher) -> Result<[u8; 16], DownloadError> {
        let key = self
            .key
            .get_or_try_init(|| async {
                debug!(url = %self.key_url, "fetching playlist key");
                let body = fetcher.get_body(self.key_url.as_str()).await.map_err(
                    |source| DownloadError::from(PlaylistError::key_unavailable(
                        self.key_url.as_str(),
                        source,
                    )),
                )?;
                let key: [u8; 16] = body
                    .try_into()
                    .map_err(|body: Vec<u8>| CryptoError::InvalidKey { len: body.len() })?;
                Ok::<_, DownloadError>(key)
            })
            .await?;
        Ok(*key)
    }

    /// Decrypts a whole segment in place.
    ///
    /// Segments are always decrypted as complete bodies; CBC chaining makes
    /// partial-chunk decryption produce garbage.
    ///
    /// # Errors
    ///
    /// Returns a [`CryptoError`] for misaligned ciphertext and key-fetch
    /// errors from [`Self::key`].
    pub async fn decrypt_segment(
        &self,
        fetcher: &HttpFetcher,
        segment_index: u64,
        explicit_iv: Option<[u8; 16]>,
        data: &mut Vec<u8>,
    ) -> Result<(), DownloadError> {
        let key = self.key(fetcher).await?;
        let iv = explicit_iv.unwrap_or_else(|| self.derive_iv(segment_index));
        decrypt_aes128_cbc(&key, &iv, data)?;
        Ok(())
    }

    /// Fetches an encrypted segment and decrypts it as one unit.
    ///
    /// Returns `None` when the fetch was canceled.
    ///
    /// # Errors
    ///
    /// Propagates transfer errors and decryption failures.
    pub async fn fetch_segment(
        &self,
        fetcher: &HttpFetcher,
        unit: &mut TransferUnit,
        explicit_iv: Option<[u8; 16]>,
        cancel: &CancelFlag,
    ) -> Result<Option<Vec<u8>>, DownloadError> {
        let Some(mut body) = fetcher
            .fetch_bytes(unit, cancel)
            .await
            .map_err(DownloadError::from)?
        else {
            return Ok(None);
        };
        self.decrypt_segment(fetcher, unit.index as u64, explicit_iv, &mut body)
            .await?;
        Ok(Some(body))
    }
}

/// Raw AES-128-CBC decryption in place, no padding removal.
///
/// # Errors
///
/// Returns [`CryptoError::BlockAlignment`] when `data` is not a multiple of
/// 16 bytes, [`CryptoError::InvalidKey`] if key/IV sizes are wrong.
pub fn decrypt_aes128_cbc(
    key: &[u8; 16],
    iv: &[u8; 16],
    data: &mut [u8],
) -> Result<(), CryptoError> {
    if data.len() % BLOCK != 0 {
        return Err(CryptoError::BlockAlignment { len: data.len() });
    }
    let decryptor = Aes128CbcDec::new_from_slices(key, iv)
        .map_err(|_| CryptoError::InvalidKey { len: key.len() })?;
    let len = data.len();
    decryptor
        .decrypt_padded_mut::<NoPadding>(data)
        .map_err(|_| CryptoError::BlockAlignment { len })?;
    Ok(())
}

/// Raw AES-128-CBC encryption. Counterpart of [`decrypt_aes128_cbc`] for
/// building encrypted fixtures.
///
/// # Errors
///
/// Returns [`CryptoError::BlockAlignment`] when `data` is not a multiple of
/// 16 bytes.
pub fn encrypt_aes128_cbc(
    key: &[u8; 16],
    iv: &[u8; 16],
    data: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if data.len() % BLOCK != 0 {
        return Err(CryptoError::BlockAlignment { len: data.len() });
    }
    let encryptor = Aes128CbcEnc::new_from_slices(key, iv)
        .map_err(|_| CryptoError::InvalidKey { len: key.len() })?;
    Ok(encryptor.encrypt_padded_vec_mut::<NoPadding>(data))
}
