use crate::Error;
use crate::cipher::chain::MessageKeys;
use crate::cipher::message::{EnvelopeMac, MAC_LENGTH};
use aes_gcm_siv::aead::Aead;
use aes_gcm_siv::{Aes256GcmSiv, KeyInit, Nonce};
use std::io::{ErrorKind, Read, Write};

/// AEAD tag appended to every sealed block.
pub(crate) const TAG_LENGTH: usize = 16;

/// Seals and opens the ciphertext body of one message as a sequence of
/// fixed-size AES-256-GCM-SIV blocks. The block index is folded into the nonce
/// so blocks cannot be reordered.
pub(crate) struct BlockCipher {
    cipher: Aes256GcmSiv,
    nonce: [u8; 12],
    block_size: usize,
    index: u32,
}

impl BlockCipher {
    pub(crate) fn new(keys: &MessageKeys, block_size: usize) -> Self {
        let key = aes_gcm_siv::Key::<Aes256GcmSiv>::from_slice(keys.cipher_key.as_slice());
        Self {
            cipher: Aes256GcmSiv::new(key),
            nonce: keys.nonce,
            block_size,
            index: 0,
        }
    }

    fn next_nonce(&mut self) -> Result<[u8; 12], Error> {
        let mut nonce = self.nonce;
        for (byte, counter) in nonce[8..12].iter_mut().zip(self.index.to_be_bytes()) {
            *byte ^= counter;
        }
        self.index = self
            .index
            .checked_add(1)
            .ok_or_else(|| Error::InvalidMessage("Too many blocks".to_string()))?;
        Ok(nonce)
    }

    pub(crate) fn sealed_block_size(&self) -> usize {
        self.block_size + TAG_LENGTH
    }

    pub(crate) fn seal(&mut self, block: &[u8]) -> Result<Vec<u8>, Error> {
        let nonce = self.next_nonce()?;
        self.cipher
            .encrypt(Nonce::from_slice(&nonce), block)
            .map_err(|_| Error::Crypto("Block encryption failed".to_string()))
    }

    pub(crate) fn open(&mut self, sealed: &[u8]) -> Result<Vec<u8>, Error> {
        if sealed.len() < TAG_LENGTH || sealed.len() > self.sealed_block_size() {
            return Err(Error::InvalidMessage("Invalid ciphertext block".to_string()));
        }
        let nonce = self.next_nonce()?;
        self.cipher
            .decrypt(Nonce::from_slice(&nonce), sealed)
            .map_err(|_| Error::InvalidMessage("Block decryption failed".to_string()))
    }

    /// Seals a whole in-memory plaintext. An empty plaintext still yields one
    /// sealed block.
    pub(crate) fn seal_all(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
        let mut ciphertext = Vec::with_capacity(
            plaintext.len() + TAG_LENGTH * (plaintext.len() / self.block_size + 1),
        );
        if plaintext.is_empty() {
            ciphertext.extend_from_slice(&self.seal(&[])?);
        }
        for block in plaintext.chunks(self.block_size) {
            ciphertext.extend_from_slice(&self.seal(block)?);
        }
        Ok(ciphertext)
    }

    pub(crate) fn open_all(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
        if ciphertext.is_empty() {
            return Err(Error::InvalidMessage("Empty ciphertext".to_string()));
        }
        let mut plaintext = Vec::with_capacity(ciphertext.len());
        for sealed in ciphertext.chunks(self.sealed_block_size()) {
            plaintext.extend_from_slice(&self.open(sealed)?);
        }
        Ok(plaintext)
    }
}

/// Reads until `buf` is full or the input is exhausted.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize, Error> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(read) => filled += read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(filled)
}

/// Streams `input` through the block cipher into `output`, feeding every
/// written ciphertext byte to `mac`. Returns the number of bytes written.
pub(crate) fn seal_stream<R: Read, W: Write>(
    cipher: &mut BlockCipher,
    mac: &mut EnvelopeMac,
    input: &mut R,
    output: &mut W,
) -> Result<u64, Error> {
    let mut buffer = vec![0u8; cipher.block_size];
    let mut written = 0u64;
    let mut blocks = 0u64;

    loop {
        let read = read_full(input, &mut buffer)?;
        if read == 0 && blocks > 0 {
            break;
        }
        let sealed = cipher.seal(&buffer[..read])?;
        mac.update(&sealed);
        output.write_all(&sealed)?;
        written += sealed.len() as u64;
        blocks += 1;
        if read < buffer.len() {
            break;
        }
    }

    Ok(written)
}

/// Reverses [`seal_stream`]. The last `MAC_LENGTH` bytes of `input` are held
/// back in a separate buffer and returned instead of being decrypted, so they
/// never reach `output`.
pub(crate) fn open_stream<R: Read, W: Write>(
    cipher: &mut BlockCipher,
    mac: &mut EnvelopeMac,
    input: &mut R,
    output: &mut W,
) -> Result<(u64, [u8; MAC_LENGTH]), Error> {
    let sealed_size = cipher.sealed_block_size();
    let mut buffer = vec![0u8; cipher.block_size];
    let mut pending: Vec<u8> = Vec::with_capacity(sealed_size + MAC_LENGTH + buffer.len());
    let mut written = 0u64;
    let mut blocks = 0u64;

    loop {
        let read = read_full(input, &mut buffer)?;
        pending.extend_from_slice(&buffer[..read]);

        while pending.len() > sealed_size + MAC_LENGTH {
            let block: Vec<u8> = pending.drain(..sealed_size).collect();
            mac.update(&block);
            let plaintext = cipher.open(&block)?;
            output.write_all(&plaintext)?;
            written += plaintext.len() as u64;
            blocks += 1;
        }

        if read < buffer.len() {
            break;
        }
    }

    if pending.len() < MAC_LENGTH {
        return Err(Error::InvalidMessage("Message too short".to_string()));
    }
    let tail = pending.split_off(pending.len() - MAC_LENGTH);
    let mut trailing_mac = [0u8; MAC_LENGTH];
    trailing_mac.copy_from_slice(&tail);

    if pending.is_empty() {
        if blocks == 0 {
            return Err(Error::InvalidMessage("Empty ciphertext".to_string()));
        }
    } else {
        mac.update(&pending);
        let plaintext = cipher.open(&pending)?;
        output.write_all(&plaintext)?;
        written += plaintext.len() as u64;
    }

    Ok((written, trailing_mac))
}
