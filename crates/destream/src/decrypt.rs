use std::{
    fs::File,
    io::{self, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use aes::{
    cipher::{
        block_padding::{Padding, Pkcs7},
        consts::U16,
        generic_array::GenericArray,
        BlockDecryptMut, KeyIvInit,
    },
    Block,
};

use crate::{
    error::{DestreamError, DestreamResult},
    fetch::AuthenticatedFetch,
    hls::EncryptionDirective,
};

const BLOCK_SIZE: usize = 16;

/// Key material for one media playlist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionKey {
    /// Normalized algorithm name, e.g. `aes128`.
    pub algorithm: String,
    pub key: [u8; 16],
    pub iv: [u8; 16],
}

/// `AES-128` -> `aes128`
pub fn normalize_algorithm(method: &str) -> String {
    method.to_lowercase().replace('-', "")
}

impl EncryptionKey {
    pub fn new(directive: &EncryptionDirective, key_bytes: Vec<u8>) -> DestreamResult<Self> {
        let algorithm = normalize_algorithm(&directive.method);
        if algorithm != "aes128" {
            return Err(DestreamError::UnsupportedAlgorithm(directive.method.clone()));
        }

        let key: [u8; 16] = key_bytes
            .try_into()
            .map_err(|v: Vec<u8>| DestreamError::InvalidKeyLength(v.len()))?;
        let iv = u128::from_str_radix(&directive.iv_hex, 16)
            .map_err(|_| DestreamError::InvalidIv(directive.iv_hex.clone()))?
            .to_be_bytes();

        Ok(Self { algorithm, key, iv })
    }

    /// Builds a fresh decoder. Every decoder starts from the playlist IV.
    pub fn decoder(&self) -> StreamingDecoder {
        StreamingDecoder::new(self)
    }
}

/// Reads the encryption directive of a media playlist and fetches its key.
///
/// Returns `Ok(None)` for plaintext content. The key is requested with an
/// authenticated POST, the IV is taken from the playlist text.
pub async fn extract_key<F>(playlist: &str, fetch: &F) -> DestreamResult<Option<EncryptionKey>>
where
    F: AuthenticatedFetch + ?Sized,
{
    let Some(directive) = EncryptionDirective::parse(playlist)? else {
        return Ok(None);
    };
    fetch_key(&directive, fetch).await.map(Some)
}

pub async fn fetch_key<F>(
    directive: &EncryptionDirective,
    fetch: &F,
) -> DestreamResult<EncryptionKey>
where
    F: AuthenticatedFetch + ?Sized,
{
    let key_bytes = fetch.post_bytes(&directive.key_uri, Vec::new()).await?;
    EncryptionKey::new(directive, key_bytes)
}

/// Incremental AES-128-CBC decoder.
///
/// Input may be fed in chunks of any size. The last complete block is held back
/// until [`StreamingDecoder::finish`] so that PKCS#7 padding can be stripped.
pub struct StreamingDecoder {
    cipher: cbc::Decryptor<aes::Aes128>,
    pending: Vec<u8>,
}

impl StreamingDecoder {
    pub fn new(key: &EncryptionKey) -> Self {
        Self {
            cipher: cbc::Decryptor::<aes::Aes128>::new(&key.key.into(), &key.iv.into()),
            pending: Vec::with_capacity(BLOCK_SIZE * 2),
        }
    }

    /// Decrypts as much of `input` as possible, appending plaintext to `output`.
    pub fn update(&mut self, input: &[u8], output: &mut Vec<u8>) {
        self.pending.extend_from_slice(input);

        let held = match self.pending.len() % BLOCK_SIZE {
            0 => BLOCK_SIZE,
            rem => rem,
        };
        if self.pending.len() <= held {
            return;
        }

        let ready = self.pending.len() - held;
        for chunk in self.pending[..ready].chunks_exact_mut(BLOCK_SIZE) {
            let block: &mut Block = GenericArray::from_mut_slice(chunk);
            self.cipher.decrypt_block_mut(block);
        }
        output.extend(self.pending.drain(..ready));
    }

    /// Decrypts the final block and strips its padding.
    pub fn finish(mut self, output: &mut Vec<u8>) -> DestreamResult<()> {
        if self.pending.len() != BLOCK_SIZE {
            return Err(DestreamError::TruncatedCiphertext);
        }

        let block: &mut Block = GenericArray::from_mut_slice(&mut self.pending);
        self.cipher.decrypt_block_mut(block);
        output.extend_from_slice(<Pkcs7 as Padding<U16>>::unpad(block)?);
        Ok(())
    }
}

/// A [`Write`] adapter decrypting everything written through it.
pub struct DecryptingWriter<W: Write> {
    inner: W,
    decoder: StreamingDecoder,
    buffer: Vec<u8>,
}

impl<W: Write> DecryptingWriter<W> {
    pub fn new(inner: W, key: &EncryptionKey) -> Self {
        Self {
            inner,
            decoder: key.decoder(),
            buffer: Vec::new(),
        }
    }

    /// Flushes the final plaintext block and returns the inner writer.
    pub fn finish(mut self) -> DestreamResult<W> {
        self.buffer.clear();
        self.decoder.finish(&mut self.buffer)?;
        self.inner.write_all(&self.buffer)?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for DecryptingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.clear();
        self.decoder.update(buf, &mut self.buffer);
        self.inner.write_all(&self.buffer)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Concatenates `inputs` in order into `output`, decrypting when a key is given.
///
/// Returns the number of plaintext bytes written.
pub fn concat_decrypt<P>(
    inputs: &[PathBuf],
    key: Option<&EncryptionKey>,
    output: P,
) -> DestreamResult<u64>
where
    P: AsRef<Path>,
{
    let output = BufWriter::new(File::create(output.as_ref())?);

    match key {
        Some(key) => {
            let mut writer = DecryptingWriter::new(CountingWriter::new(output), key);
            for input in inputs {
                io::copy(&mut BufReader::new(File::open(input)?), &mut writer)?;
            }
            Ok(writer.finish()?.written)
        }
        None => {
            let mut writer = CountingWriter::new(output);
            for input in inputs {
                io::copy(&mut BufReader::new(File::open(input)?), &mut writer)?;
            }
            writer.flush()?;
            Ok(writer.written)
        }
    }
}

struct CountingWriter<W> {
    inner: W,
    written: u64,
}

impl<W> CountingWriter<W> {
    fn new(inner: W) -> Self {
        Self { inner, written: 0 }
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
