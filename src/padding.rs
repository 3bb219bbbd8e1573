//! Padding codec for the first frames of a tunnel.
//!
//! The first [`FIRST_PADDINGS`] writes in each direction are framed as
//!
//! ```text
//! +----------------+-------------+-----------+-----------------+
//! | data len (u16) | pad len(u8) |   data    |  pad len bytes  |
//! +----------------+-------------+-----------+-----------------+
//! ```
//!
//! with a random padding length. After that, bytes flow unframed. The codec
//! is sans-io: it encodes into and decodes out of caller-owned buffers, so
//! the same state machine serves the async client side and the blocking
//! loopback engine.

use bytes::{Buf, BufMut, BytesMut};

/// Number of framed writes (and reads) at the start of a connection.
pub const FIRST_PADDINGS: usize = 8;

/// Size of the frame header.
pub const PADDING_HEADER_SIZE: usize = 3;

/// Largest padding a frame can carry.
pub const MAX_PADDING_SIZE: usize = 255;

/// Largest payload a single frame can carry.
pub const MAX_PAYLOAD_SIZE: usize = 65535;

const PADDING_HEADER_CHARS: &[u8; 16] = b"!#$()+<>?@[]^`{}";

/// Per-connection padding state for both directions.
#[derive(Debug, Default, Clone)]
pub struct PaddingCodec {
    read_padding: usize,
    write_padding: usize,
    read_remaining: usize,
    padding_remaining: usize,
}

impl PaddingCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `data` to `out`, framing each chunk of at most
    /// [`MAX_PAYLOAD_SIZE`] bytes while the write cap is not reached.
    pub fn encode(&mut self, data: &[u8], out: &mut BytesMut) {
        for chunk in data.chunks(MAX_PAYLOAD_SIZE) {
            self.encode_chunk(chunk, out);
        }
    }

    fn encode_chunk(&mut self, chunk: &[u8], out: &mut BytesMut) {
        if self.write_padding >= FIRST_PADDINGS {
            out.extend_from_slice(chunk);
            return;
        }
        let padding_len = random_padding_len();
        out.reserve(PADDING_HEADER_SIZE + chunk.len() + padding_len);
        out.put_u16(chunk.len() as u16);
        out.put_u8(padding_len as u8);
        out.extend_from_slice(chunk);
        out.put_bytes(0, padding_len);
        self.write_padding += 1;
    }

    /// Frames a buffer in place.
    ///
    /// `buffer[..reserved]` is headroom set aside by the caller (see
    /// [`front_headroom`](Self::front_headroom)); the payload follows it. On
    /// return `buffer` holds exactly the bytes to put on the wire. Without
    /// enough headroom, or for payloads larger than one frame, this falls
    /// back to an encoding copy.
    pub fn encode_in_place(&mut self, buffer: &mut BytesMut, reserved: usize) {
        let reserved = reserved.min(buffer.len());
        let payload_len = buffer.len() - reserved;

        if self.write_padding >= FIRST_PADDINGS {
            buffer.advance(reserved);
            return;
        }

        if reserved < PADDING_HEADER_SIZE || payload_len > MAX_PAYLOAD_SIZE || payload_len == 0 {
            let payload = buffer.split_off(reserved);
            buffer.clear();
            self.encode(&payload, buffer);
            return;
        }

        let padding_len = random_padding_len();
        let start = reserved - PADDING_HEADER_SIZE;
        buffer[start..start + 2].copy_from_slice(&(payload_len as u16).to_be_bytes());
        buffer[start + 2] = padding_len as u8;
        buffer.advance(start);
        buffer.put_bytes(0, padding_len);
        self.write_padding += 1;
    }

    /// Decodes payload bytes from `input` into `buf`.
    ///
    /// Consumes headers and filler from `input` as it goes and returns the
    /// number of payload bytes written to `buf`. A return of zero with a
    /// non-empty `buf` means more input is needed. Frames may be split at
    /// any byte boundary across calls, and `buf` may be arbitrarily small.
    pub fn decode(&mut self, input: &mut BytesMut, buf: &mut [u8]) -> usize {
        if buf.is_empty() {
            return 0;
        }
        loop {
            if self.read_remaining > 0 {
                let n = self.read_remaining.min(buf.len()).min(input.len());
                if n == 0 {
                    return 0;
                }
                input.copy_to_slice(&mut buf[..n]);
                self.read_remaining -= n;
                return n;
            }

            if self.padding_remaining > 0 {
                let n = self.padding_remaining.min(input.len());
                input.advance(n);
                self.padding_remaining -= n;
                if self.padding_remaining > 0 {
                    return 0;
                }
                continue;
            }

            if self.read_padding < FIRST_PADDINGS {
                if input.len() < PADDING_HEADER_SIZE {
                    return 0;
                }
                self.read_remaining = input.get_u16() as usize;
                self.padding_remaining = input.get_u8() as usize;
                self.read_padding += 1;
                continue;
            }

            let n = buf.len().min(input.len());
            input.copy_to_slice(&mut buf[..n]);
            return n;
        }
    }

    /// Bytes the next write needs in front of its payload.
    pub fn front_headroom(&self) -> usize {
        if self.write_padding < FIRST_PADDINGS {
            PADDING_HEADER_SIZE
        } else {
            0
        }
    }

    /// Bytes the next write may append after its payload.
    pub fn rear_headroom(&self) -> usize {
        if self.write_padding < FIRST_PADDINGS {
            MAX_PADDING_SIZE
        } else {
            0
        }
    }

    /// Largest payload the next write can frame without splitting.
    pub fn writer_mtu(&self) -> usize {
        if self.write_padding < FIRST_PADDINGS {
            MAX_PAYLOAD_SIZE
        } else {
            0
        }
    }

    /// True once reads are plain passthrough and no frame is half consumed.
    pub fn reader_replaceable(&self) -> bool {
        self.read_padding >= FIRST_PADDINGS && self.read_remaining == 0 && self.padding_remaining == 0
    }

    /// True while a frame's payload is only partly delivered.
    pub fn read_frame_pending(&self) -> bool {
        self.read_remaining > 0
    }

    /// True once writes are plain passthrough.
    pub fn writer_replaceable(&self) -> bool {
        self.write_padding >= FIRST_PADDINGS
    }
}

fn random_padding_len() -> usize {
    let mut byte = [0u8; 1];
    match getrandom::getrandom(&mut byte) {
        Ok(()) => byte[0] as usize,
        Err(_) => 0,
    }
}

/// Value of the `Padding` request header: 30 to 61 characters, the first
/// sixteen drawn from a fixed alphabet and the rest `~`.
pub fn generate_padding_header() -> String {
    let mut random = [0u8; 9];
    if getrandom::getrandom(&mut random).is_err() {
        random = [0; 9];
    }
    let len = 30 + (random[0] as usize % 32);
    let mut bits = u64::from_le_bytes([
        random[1], random[2], random[3], random[4], random[5], random[6], random[7], random[8],
    ]);
    let mut header = String::with_capacity(len);
    for _ in 0..16 {
        header.push(PADDING_HEADER_CHARS[(bits & 15) as usize] as char);
        bits >>= 4;
    }
    while header.len() < len {
        header.push('~');
    }
    header
}
