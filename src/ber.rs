// BER stream codec for LDAP
// Nested-sequence writer and length-tracking reader over one duplex stream

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};
use tracing::trace;

use crate::error::{LdapError, Result};

// Universal tags
pub const BOOLEAN: u8 = 0x01;
pub const INTEGER: u8 = 0x02;
pub const OCTET_STRING: u8 = 0x04;
pub const NULL: u8 = 0x05;
pub const ENUMERATION: u8 = 0x0A;
/// SEQUENCE | CONSTRUCTOR
pub const SEQUENCE: u8 = 0x30;
/// SET | CONSTRUCTOR
pub const SET: u8 = 0x31;

/// Largest length expressible with the definite forms used here (`0x83` + three octets).
pub const MAX_LENGTH: usize = 0xFF_FFFF;

const SKIP_CHUNK: usize = 4096;

/// Append the minimal definite-form encoding of `len`.
pub fn encode_length(buf: &mut BytesMut, len: usize) -> Result<()> {
    if len <= 0x7F {
        buf.put_u8(len as u8);
    } else if len <= 0xFF {
        buf.put_u8(0x81);
        buf.put_u8(len as u8);
    } else if len <= 0xFFFF {
        buf.put_u8(0x82);
        buf.put_u16(len as u16);
    } else if len <= MAX_LENGTH {
        buf.put_u8(0x83);
        buf.put_u8((len >> 16) as u8);
        buf.put_u16(len as u16);
    } else {
        return Err(LdapError::protocol(format!("Length too long: {}", len)));
    }
    Ok(())
}

/// Minimal big-endian two's-complement octets of `value` (1 to 4 bytes).
fn integer_octets(value: i32) -> ([u8; 4], usize) {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < 3 {
        let redundant = (bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
            || (bytes[start] == 0xFF && bytes[start + 1] & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    (bytes, start)
}

/// Sign-extend up to four content octets into an i32.
fn decode_integer(bytes: &[u8]) -> Result<i32> {
    if bytes.is_empty() || bytes.len() > 4 {
        return Err(LdapError::protocol(format!(
            "Integer must be 1 to 4 bytes, got: {}",
            bytes.len()
        )));
    }
    let fill = if bytes[0] & 0x80 != 0 { 0xFF } else { 0x00 };
    let mut padded = [fill; 4];
    padded[4 - bytes.len()..].copy_from_slice(bytes);
    Ok(i32::from_be_bytes(padded))
}

fn describe_tags(tags: &[u8]) -> String {
    match tags {
        [single] => format!("0x{:02X}", single),
        _ => {
            let list: Vec<String> = tags.iter().map(|t| format!("0x{:02X}", t)).collect();
            format!("one of [{}]", list.join(", "))
        }
    }
}

/// Sequence opened for writing; its tag and length are emitted on close.
struct WriteFrame {
    tag: u8,
    content: BytesMut,
}

/// Sequence opened for reading.
struct ReadFrame {
    tag: u8,
    length: usize,
    consumed: usize,
}

impl ReadFrame {
    fn remaining(&self) -> usize {
        self.length - self.consumed
    }
}

/// BER codec bound to one connection's byte stream.
///
/// Writes accumulate in a stack of content buffers, one per open sequence;
/// `end_sequence` prefixes tag and length and folds the buffer into its
/// parent. `flush` sends the finished PDU.
///
/// Reads go straight to the stream. Every open sequence keeps a byte
/// budget so repeated elements can be consumed with
/// `while stream.remaining() > 0`, and any value that would run past its
/// enclosing sequence is rejected before it is read.
pub struct BerStream<S> {
    io: BufStream<S>,
    out: BytesMut,
    writes: Vec<WriteFrame>,
    reads: Vec<ReadFrame>,
}

impl<S> BerStream<S>
where
    S: AsyncRead + AsyncWrite,
{
    pub fn new(stream: S) -> Self {
        Self {
            io: BufStream::new(stream),
            out: BytesMut::with_capacity(1024),
            writes: Vec::new(),
            reads: Vec::new(),
        }
    }
}

impl<S> BerStream<S> {
    fn current(&mut self) -> &mut BytesMut {
        match self.writes.last_mut() {
            Some(frame) => &mut frame.content,
            None => &mut self.out,
        }
    }

    pub fn start_sequence(&mut self, tag: u8) {
        self.writes.push(WriteFrame {
            tag,
            content: BytesMut::new(),
        });
    }

    pub fn end_sequence(&mut self) -> Result<()> {
        let frame = self
            .writes
            .pop()
            .ok_or_else(|| LdapError::protocol("end_sequence without open sequence"))?;
        let mut header = BytesMut::with_capacity(4);
        header.put_u8(frame.tag);
        encode_length(&mut header, frame.content.len())?;
        let parent = self.current();
        parent.extend_from_slice(&header);
        parent.extend_from_slice(&frame.content);
        Ok(())
    }

    pub fn write_byte(&mut self, b: u8) {
        self.current().put_u8(b);
    }

    pub fn write(&mut self, raw: &[u8]) {
        self.current().extend_from_slice(raw);
    }

    pub fn write_length(&mut self, len: usize) -> Result<()> {
        encode_length(self.current(), len)
    }

    pub fn write_int(&mut self, value: i32) {
        self.write_int_tagged(value, INTEGER);
    }

    pub fn write_int_tagged(&mut self, value: i32, tag: u8) {
        let (bytes, start) = integer_octets(value);
        let buf = self.current();
        buf.put_u8(tag);
        buf.put_u8((4 - start) as u8);
        buf.extend_from_slice(&bytes[start..]);
    }

    pub fn write_enumeration(&mut self, value: i32) {
        self.write_int_tagged(value, ENUMERATION);
    }

    pub fn write_boolean(&mut self, value: bool) {
        self.write_boolean_tagged(value, BOOLEAN);
    }

    pub fn write_boolean_tagged(&mut self, value: bool, tag: u8) {
        let buf = self.current();
        buf.put_u8(tag);
        buf.put_u8(0x01);
        buf.put_u8(if value { 0xFF } else { 0x00 });
    }

    pub fn write_null(&mut self) {
        let buf = self.current();
        buf.put_u8(NULL);
        buf.put_u8(0x00);
    }

    pub fn write_string(&mut self, value: impl AsRef<[u8]>) -> Result<()> {
        self.write_string_tagged(value, OCTET_STRING)
    }

    pub fn write_string_tagged(&mut self, value: impl AsRef<[u8]>, tag: u8) -> Result<()> {
        let value = value.as_ref();
        let mut header = BytesMut::with_capacity(5);
        header.put_u8(tag);
        encode_length(&mut header, value.len())?;
        let buf = self.current();
        buf.extend_from_slice(&header);
        buf.extend_from_slice(value);
        Ok(())
    }

    /// Number of sequences opened for writing and not yet closed.
    pub fn write_depth(&self) -> usize {
        self.writes.len()
    }

    /// Bytes of finished, not yet flushed, top-level frames.
    pub fn pending(&self) -> &[u8] {
        &self.out
    }

    /// Drop everything written since the last flush.
    pub fn discard_writes(&mut self) {
        self.writes.clear();
        self.out.clear();
    }

    /// Bytes left unread in the innermost open sequence (0 when none is open).
    pub fn remaining(&self) -> usize {
        self.reads.last().map(ReadFrame::remaining).unwrap_or(0)
    }

    /// Number of sequences opened for reading and not yet finished.
    pub fn read_depth(&self) -> usize {
        self.reads.len()
    }

    /// Close the innermost read sequence and debit its full length from the parent.
    ///
    /// Fails without popping when the sequence was not consumed completely,
    /// so the caller can still drain it.
    pub fn finish_sequence(&mut self) -> Result<()> {
        let frame = self
            .reads
            .last()
            .ok_or_else(|| LdapError::protocol("finish_sequence without open sequence"))?;
        if frame.consumed != frame.length {
            return Err(LdapError::protocol(format!(
                "Sequence 0x{:02X} consumed {} of {} bytes",
                frame.tag, frame.consumed, frame.length
            )));
        }
        let length = frame.length;
        self.reads.pop();
        if let Some(parent) = self.reads.last_mut() {
            parent.consumed += length;
        }
        Ok(())
    }
}

impl<S> BerStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Write the finished PDU to the transport and reset the write state.
    pub async fn flush(&mut self) -> Result<()> {
        if !self.writes.is_empty() {
            let open = self.writes.len();
            self.discard_writes();
            return Err(LdapError::protocol(format!(
                "flush with {} unterminated sequence(s)",
                open
            )));
        }
        trace!(bytes = self.out.len(), pdu = %hex::encode(&self.out), ">>>");
        self.io.write_all(&self.out).await?;
        self.io.flush().await?;
        self.out.clear();
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.io.shutdown().await?;
        Ok(())
    }

    fn check_budget(&self, n: usize) -> Result<()> {
        if let Some(frame) = self.reads.last() {
            if n > frame.remaining() {
                return Err(LdapError::protocol(format!(
                    "{} bytes requested but sequence 0x{:02X} has {} remaining",
                    n,
                    frame.tag,
                    frame.remaining()
                )));
            }
        }
        Ok(())
    }

    async fn read_raw(&mut self, buf: &mut [u8]) -> Result<()> {
        self.check_budget(buf.len())?;
        self.io.read_exact(buf).await?;
        if let Some(frame) = self.reads.last_mut() {
            frame.consumed += buf.len();
        }
        Ok(())
    }

    async fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_raw(&mut buf).await?;
        Ok(buf[0])
    }

    /// Read one tag byte, failing unless it is one of `expected`.
    pub async fn read_tag(&mut self, expected: &[u8]) -> Result<u8> {
        let tag = self.read_u8().await?;
        if !expected.contains(&tag) {
            return Err(LdapError::protocol(format!(
                "Expected {}, have 0x{:02X}",
                describe_tags(expected),
                tag
            )));
        }
        Ok(tag)
    }

    pub async fn decode_length(&mut self) -> Result<usize> {
        let first = self.read_u8().await?;
        if first & 0x80 == 0 {
            return Ok(first as usize);
        }
        let octets = (first & 0x7F) as usize;
        if octets == 0 {
            return Err(LdapError::protocol("Indefinite length not supported"));
        }
        if octets > 4 {
            return Err(LdapError::protocol(format!("Length too long: 0x{:02X}", first)));
        }
        let mut buf = [0u8; 4];
        self.read_raw(&mut buf[4 - octets..]).await?;
        let length = u32::from_be_bytes(buf) as usize;
        if length > MAX_LENGTH {
            return Err(LdapError::protocol(format!("Length too long: {}", length)));
        }
        Ok(length)
    }

    /// Read a constructed tag and its length, then open it for reading.
    pub async fn read_sequence(&mut self, expected: &[u8]) -> Result<u8> {
        let tag = self.read_tag(expected).await?;
        let length = self.decode_length().await?;
        self.check_budget(length)?;
        self.reads.push(ReadFrame {
            tag,
            length,
            consumed: 0,
        });
        Ok(tag)
    }

    /// Discard the unread rest of the innermost sequence.
    pub async fn skip_remaining(&mut self) -> Result<()> {
        let mut chunk = [0u8; SKIP_CHUNK];
        while self.remaining() > 0 {
            let n = self.remaining().min(SKIP_CHUNK);
            self.read_raw(&mut chunk[..n]).await?;
        }
        Ok(())
    }

    /// Drain and close every open read sequence, leaving the stream on a PDU boundary.
    pub async fn recover(&mut self) -> Result<()> {
        while !self.reads.is_empty() {
            self.skip_remaining().await?;
            self.finish_sequence()?;
        }
        Ok(())
    }

    /// Read a primitive value with one of the `expected` tags.
    pub async fn read_value(&mut self, expected: &[u8]) -> Result<(u8, Vec<u8>)> {
        let tag = self.read_tag(expected).await?;
        let length = self.decode_length().await?;
        self.check_budget(length)?;
        let mut value = vec![0u8; length];
        self.read_raw(&mut value).await?;
        Ok((tag, value))
    }

    pub async fn read_int(&mut self) -> Result<i32> {
        self.read_int_tagged(&[INTEGER]).await
    }

    pub async fn read_int_tagged(&mut self, expected: &[u8]) -> Result<i32> {
        let (_, value) = self.read_value(expected).await?;
        decode_integer(&value)
    }

    pub async fn read_enumeration(&mut self) -> Result<i32> {
        self.read_int_tagged(&[ENUMERATION]).await
    }

    /// Raw octets of an OCTET STRING.
    pub async fn read_string(&mut self) -> Result<Vec<u8>> {
        let (_, value) = self.read_value(&[OCTET_STRING]).await?;
        Ok(value)
    }

    /// OCTET STRING that must hold UTF-8 text (DNs, attribute descriptions, messages).
    pub async fn read_utf8(&mut self) -> Result<String> {
        let value = self.read_string().await?;
        String::from_utf8(value).map_err(|_| LdapError::protocol("Invalid UTF-8 string"))
    }

    pub async fn read_boolean(&mut self) -> Result<bool> {
        let (_, value) = self.read_value(&[BOOLEAN]).await?;
        Ok(value.as_slice() != [0x00])
    }
}
