//! Serial protocol for persistent VM state
//!
//! A [`Serial`] session wraps a byte stream and carries the protocol
//! version plus a flag controlling whether 4-byte framing signatures are
//! interleaved with the data. Signatures catch stream desynchronization
//! early: every structural block opens with a tag and closes with the
//! bitwise complement of the same tag.
//!
//! All multi-byte integers inside a session are VLN-encoded: 7 payload
//! bits per byte in big-endian group order, with the high bit set on
//! every byte except the last. A 32-bit Word never needs more than 5
//! bytes.

use acsvm_bytecode::Word;
use std::io::{Read, Write};
use thiserror::Error;

/// Stream magic written by `save_head`
pub const MAGIC: [u8; 6] = *b"ACSVM\0";

/// Current protocol version. Version 0 is the legacy dense array format,
/// supported on read only.
pub const VERSION: u32 = 1;

/// Flags-word bit indicating signature framing is enabled
const FLAG_SIGNS: Word = 1;

/// Errors produced while reading or writing serialized state
#[derive(Debug, Error)]
pub enum SerialError {
    /// Underlying byte transfer failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Stream did not start with the ACSVM magic
    #[error("Invalid stream magic: {0:?}")]
    BadMagic([u8; 6]),

    /// Stream version is newer than this implementation
    #[error("Unsupported protocol version: {0} (current: {VERSION})")]
    UnsupportedVersion(u32),

    /// A framing signature did not match its expected tag
    #[error("Signature mismatch: expected {expected:#010x}, got {found:#010x}")]
    SignMismatch {
        /// Tag the reader expected at this position
        expected: Word,
        /// Tag actually present in the stream
        found: Word,
    },

    /// Structurally invalid data
    #[error("Corrupt stream: {0}")]
    Corrupt(&'static str),
}

/// Framing signatures, interpreted as big-endian 32-bit tag values.
/// Blocks close with the bitwise complement of their opening tag.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signature {
    /// Sparse array block
    Array = 0x4152_4159, // "ARAY"
    /// Environment block
    Environ = 0x454E_5649, // "ENVI"
    /// Global scope block
    GlobalScope = 0x4742_4C73, // "GBLs"
    /// Hub scope block
    HubScope = 0x4855_4273, // "HUBs"
    /// Map scope block
    MapScope = 0x4D41_5073, // "MAPs"
    /// Module scope block
    ModuleScope = 0x4D4F_4473, // "MODs"
    /// Whole-stream framing
    Serial = 0x5345_5249, // "SERI"
    /// Thread block
    Thread = 0x5448_5244, // "THRD"
}

impl Signature {
    /// The tag as a Word
    pub fn to_word(self) -> Word {
        self as Word
    }
}

/// A serialization session over a byte stream
///
/// Construct with [`Serial::new_writer`] or [`Serial::new_reader`]; the
/// read-side `version`/`signs` fields are filled in by `load_head`.
pub struct Serial<S> {
    stream: S,
    /// Protocol version of this session
    pub version: u32,
    /// Whether framing signatures are present
    pub signs: bool,
}

impl<S> Serial<S> {
    /// Consume the session and return the underlying stream
    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<W: Write> Serial<W> {
    /// Start a writing session at the current protocol version
    pub fn new_writer(stream: W, signs: bool) -> Self {
        Self {
            stream,
            version: VERSION,
            signs,
        }
    }

    /// Write the stream header: magic, version, flags
    pub fn save_head(&mut self) -> Result<(), SerialError> {
        self.stream.write_all(&MAGIC)?;
        self.write_vln(self.version)?;
        self.write_vln(if self.signs { FLAG_SIGNS } else { 0 })?;
        Ok(())
    }

    /// Write the closing stream signature
    pub fn save_tail(&mut self) -> Result<(), SerialError> {
        self.write_sign(!Signature::Serial.to_word())
    }

    /// Write a single byte
    pub fn write_byte(&mut self, byte: u8) -> Result<(), SerialError> {
        self.stream.write_all(&[byte])?;
        Ok(())
    }

    /// Write a VLN-encoded Word
    pub fn write_vln(&mut self, value: Word) -> Result<(), SerialError> {
        let mut buf = [0u8; 5];
        let mut pos = buf.len();
        let mut rest = value;
        loop {
            pos -= 1;
            buf[pos] = (rest & 0x7F) as u8;
            rest >>= 7;
            if rest == 0 {
                break;
            }
        }
        // Continuation bit on every byte but the last.
        let last = buf.len() - 1;
        for byte in &mut buf[pos..last] {
            *byte |= 0x80;
        }
        self.stream.write_all(&buf[pos..])?;
        Ok(())
    }

    /// Write a length-prefixed UTF-8 string
    pub fn write_str(&mut self, value: &str) -> Result<(), SerialError> {
        self.write_vln(value.len() as Word)?;
        self.stream.write_all(value.as_bytes())?;
        Ok(())
    }

    /// Write a 4-byte big-endian signature tag, if signatures are enabled
    pub fn write_sign(&mut self, sign: Word) -> Result<(), SerialError> {
        if self.signs {
            self.stream.write_all(&sign.to_be_bytes())?;
        }
        Ok(())
    }
}

impl<R: Read> Serial<R> {
    /// Start a reading session; `load_head` fills in version and flags
    pub fn new_reader(stream: R) -> Self {
        Self {
            stream,
            version: 0,
            signs: false,
        }
    }

    /// Read and validate the stream header
    pub fn load_head(&mut self) -> Result<(), SerialError> {
        let mut magic = [0u8; 6];
        self.stream.read_exact(&mut magic)?;
        if magic != MAGIC {
            return Err(SerialError::BadMagic(magic));
        }

        let version = self.read_vln()?;
        if version > VERSION {
            return Err(SerialError::UnsupportedVersion(version));
        }
        self.version = version;

        let flags = self.read_vln()?;
        self.signs = flags & FLAG_SIGNS != 0;
        Ok(())
    }

    /// Read and validate the closing stream signature
    pub fn load_tail(&mut self) -> Result<(), SerialError> {
        self.read_sign(!Signature::Serial.to_word())
    }

    /// Read a single byte
    pub fn read_byte(&mut self) -> Result<u8, SerialError> {
        let mut buf = [0u8; 1];
        self.stream.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    /// Read a VLN-encoded Word
    pub fn read_vln(&mut self) -> Result<Word, SerialError> {
        let mut acc: Word = 0;
        loop {
            let byte = self.read_byte()?;
            acc = (acc << 7) | Word::from(byte & 0x7F);
            if byte & 0x80 == 0 {
                return Ok(acc);
            }
        }
    }

    /// Read a length-prefixed UTF-8 string
    pub fn read_str(&mut self) -> Result<String, SerialError> {
        let len = self.read_vln()? as usize;
        let mut bytes = vec![0u8; len];
        self.stream.read_exact(&mut bytes)?;
        String::from_utf8(bytes).map_err(|_| SerialError::Corrupt("invalid UTF-8 string"))
    }

    /// Read a 4-byte big-endian signature tag, if signatures are enabled,
    /// and fail unless it equals `expected`
    pub fn read_sign(&mut self, expected: Word) -> Result<(), SerialError> {
        if self.signs {
            let mut buf = [0u8; 4];
            self.stream.read_exact(&mut buf)?;
            let found = Word::from_be_bytes(buf);
            if found != expected {
                return Err(SerialError::SignMismatch { expected, found });
            }
        }
        Ok(())
    }
}
