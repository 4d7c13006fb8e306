//! XDR (RFC 4506) encoding for the libvirt remote protocol.
//!
//! Only the shapes appvm sends and receives are covered: 32/64-bit integers,
//! strings, optional strings, fixed 16-byte UUIDs, and `remote_nonnull_domain`.
//!
//! Packet layout on the socket:
//!
//! ```text
//! u32 length (including itself)
//! u32 program | u32 version | i32 procedure | i32 type | u32 serial | i32 status
//! payload…
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::hypervisor::DomainHandle;

pub const REMOTE_PROGRAM: u32 = 0x2000_8086;
pub const REMOTE_PROTOCOL_VERSION: u32 = 1;

/// Length word plus the six header words.
pub const PACKET_HEADER_LEN: usize = 28;
/// libvirt refuses packets larger than this.
pub const MAX_PACKET_LEN: usize = 32 * 1024 * 1024;

pub const TYPE_CALL: i32 = 0;
pub const TYPE_REPLY: i32 = 1;

pub const STATUS_OK: i32 = 0;
pub const STATUS_ERROR: i32 = 1;

pub const UUID_LEN: usize = 16;

/// Malformed or truncated data from the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeError(pub String);

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "malformed XDR: {}", self.0)
    }
}

pub type DecodeResult<T> = std::result::Result<T, DecodeError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub program: u32,
    pub version: u32,
    pub procedure: i32,
    pub kind: i32,
    pub serial: u32,
    pub status: i32,
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct XdrWriter {
    buf: BytesMut,
}

impl XdrWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.buf.put_u32(v);
        self
    }

    pub fn put_i32(&mut self, v: i32) -> &mut Self {
        self.buf.put_i32(v);
        self
    }

    pub fn put_u64(&mut self, v: u64) -> &mut Self {
        self.buf.put_u64(v);
        self
    }

    pub fn put_string(&mut self, s: &str) -> &mut Self {
        self.put_opaque(s.as_bytes())
    }

    pub fn put_opt_string(&mut self, s: Option<&str>) -> &mut Self {
        match s {
            Some(s) => self.put_u32(1).put_string(s),
            None => self.put_u32(0),
        }
    }

    pub fn put_domain(&mut self, dom: &DomainHandle) -> &mut Self {
        self.put_string(&dom.name);
        self.buf.put_slice(&dom.uuid);
        self.put_i32(dom.id)
    }

    fn put_opaque(&mut self, data: &[u8]) -> &mut Self {
        self.buf.put_u32(data.len() as u32);
        self.buf.put_slice(data);
        self.buf.put_bytes(0, padding(data.len()));
        self
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Frame a call packet around an encoded argument payload.
pub fn encode_call(procedure: i32, serial: u32, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(PACKET_HEADER_LEN + payload.len());
    buf.put_u32((PACKET_HEADER_LEN + payload.len()) as u32);
    buf.put_u32(REMOTE_PROGRAM);
    buf.put_u32(REMOTE_PROTOCOL_VERSION);
    buf.put_i32(procedure);
    buf.put_i32(TYPE_CALL);
    buf.put_u32(serial);
    buf.put_i32(STATUS_OK);
    buf.put_slice(payload);
    buf.freeze()
}

fn padding(len: usize) -> usize {
    (4 - len % 4) % 4
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

pub struct XdrReader {
    buf: Bytes,
}

impl XdrReader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    /// Whatever has not been decoded yet.
    pub fn into_remaining(self) -> Bytes {
        self.buf
    }

    fn need(&self, n: usize, what: &str) -> DecodeResult<()> {
        if self.buf.remaining() < n {
            return Err(DecodeError(format!(
                "truncated {what}: need {n} bytes, have {}",
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub fn get_u32(&mut self) -> DecodeResult<u32> {
        self.need(4, "u32")?;
        Ok(self.buf.get_u32())
    }

    pub fn get_i32(&mut self) -> DecodeResult<i32> {
        self.need(4, "i32")?;
        Ok(self.buf.get_i32())
    }

    pub fn get_u64(&mut self) -> DecodeResult<u64> {
        self.need(8, "u64")?;
        Ok(self.buf.get_u64())
    }

    pub fn get_string(&mut self) -> DecodeResult<String> {
        let len = self.get_u32()? as usize;
        self.need(len + padding(len), "string")?;
        let data = self.buf.split_to(len);
        self.buf.advance(padding(len));
        String::from_utf8(data.to_vec()).map_err(|e| DecodeError(e.to_string()))
    }

    pub fn get_opt_string(&mut self) -> DecodeResult<Option<String>> {
        match self.get_u32()? {
            0 => Ok(None),
            1 => self.get_string().map(Some),
            other => Err(DecodeError(format!("bad optional discriminant {other}"))),
        }
    }

    pub fn get_domain(&mut self) -> DecodeResult<DomainHandle> {
        let name = self.get_string()?;
        self.need(UUID_LEN, "uuid")?;
        let mut uuid = [0u8; UUID_LEN];
        self.buf.copy_to_slice(&mut uuid);
        let id = self.get_i32()?;
        Ok(DomainHandle { name, uuid, id })
    }

    pub fn get_domains(&mut self) -> DecodeResult<Vec<DomainHandle>> {
        let count = self.get_u32()? as usize;
        // Each domain is at least 24 bytes; reject counts the buffer can't hold.
        self.need(count.saturating_mul(24), "domain list")?;
        (0..count).map(|_| self.get_domain()).collect()
    }
}

/// Decode the six header words following the length prefix.
pub fn decode_header(reader: &mut XdrReader) -> DecodeResult<Header> {
    Ok(Header {
        program: reader.get_u32()?,
        version: reader.get_u32()?,
        procedure: reader.get_i32()?,
        kind: reader.get_i32()?,
        serial: reader.get_u32()?,
        status: reader.get_i32()?,
    })
}

/// The leading fields of `remote_error`; the rest is not needed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub code: i32,
    pub domain: i32,
    pub message: Option<String>,
}

pub fn decode_error(reader: &mut XdrReader) -> DecodeResult<RemoteError> {
    Ok(RemoteError {
        code: reader.get_i32()?,
        domain: reader.get_i32()?,
        message: reader.get_opt_string()?,
    })
}
