use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Start-of-frame marker.
pub const SYNC: u8 = 0xFE;

/// Largest payload a frame may carry.
pub const MAX_PAYLOAD: usize = 250;

const HEADER_LEN: usize = 3; // sync, len, msg_id
const CRC_LEN: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("checksum mismatch on msg {msg_id}: expected {expected:#06x}, got {actual:#06x}")]
    Checksum { msg_id: u8, expected: u16, actual: u16 },

    #[error("invalid payload length {len} for msg {msg_id}")]
    Length { msg_id: u8, len: usize },

    #[error("malformed field `{field}` in msg {msg_id}")]
    Malformed { msg_id: u8, field: &'static str },

    #[error("field `{field}` in msg {msg_id} is {len} bytes, at most {max} fit")]
    FieldTooLong { msg_id: u8, field: &'static str, len: usize, max: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_id: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(msg_id: u8, payload: impl Into<Bytes>) -> Self {
        Self { msg_id, payload: payload.into() }
    }

    /// Serialize to wire bytes. Fails if the payload does not fit in one frame.
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        let len = self.payload.len();
        if len > MAX_PAYLOAD {
            return Err(FrameError::Length { msg_id: self.msg_id, len });
        }
        let mut out = BytesMut::with_capacity(HEADER_LEN + len + CRC_LEN);
        out.put_u8(SYNC);
        out.put_u8(len as u8);
        out.put_u8(self.msg_id);
        out.put_slice(&self.payload);
        let crc = crc16(&out[1..]);
        out.put_u16_le(crc);
        Ok(out.freeze())
    }
}

/// CRC-16/MCRF4XX (the X.25 accumulator MAVLink uses), seed 0xFFFF.
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0xFFFF, |crc, b| crc_accumulate(*b, crc))
}

fn crc_accumulate(byte: u8, crc: u16) -> u16 {
    let mut tmp = byte ^ (crc & 0xFF) as u8;
    tmp ^= tmp << 4;
    let tmp = tmp as u16;
    (crc >> 8) ^ (tmp << 8) ^ (tmp << 3) ^ (tmp >> 4)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderStats {
    pub frames: u64,
    pub checksum_errors: u64,
    pub length_errors: u64,
    pub bytes_discarded: u64,
}

/// Incremental deframer. Feed raw transport bytes with [`push`](Self::push), then drain
/// frames with [`next_frame`](Self::next_frame) until it returns `None`.
///
/// A bad checksum drops exactly the declared frame; an impossible length drops only the
/// sync byte, since the length itself cannot be trusted.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
    stats: DecoderStats,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn next_frame(&mut self) -> Option<Result<Frame, FrameError>> {
        match self.buf.iter().position(|b| *b == SYNC) {
            Some(0) => {}
            Some(skip) => self.discard(skip),
            None => {
                let all = self.buf.len();
                self.discard(all);
                return None;
            }
        }

        if self.buf.len() < HEADER_LEN {
            return None;
        }
        let len = self.buf[1] as usize;
        let msg_id = self.buf[2];
        if len > MAX_PAYLOAD {
            self.discard(1);
            self.stats.length_errors += 1;
            return Some(Err(FrameError::Length { msg_id, len }));
        }

        let total = HEADER_LEN + len + CRC_LEN;
        if self.buf.len() < total {
            return None;
        }

        let expected = crc16(&self.buf[1..HEADER_LEN + len]);
        let actual = u16::from_le_bytes([self.buf[total - 2], self.buf[total - 1]]);
        if expected != actual {
            self.discard(total);
            self.stats.checksum_errors += 1;
            return Some(Err(FrameError::Checksum { msg_id, expected, actual }));
        }

        let mut raw = self.buf.split_to(total);
        raw.advance(HEADER_LEN);
        raw.truncate(len);
        self.stats.frames += 1;
        Some(Ok(Frame { msg_id, payload: raw.freeze() }))
    }

    fn discard(&mut self, n: usize) {
        self.buf.advance(n);
        self.stats.bytes_discarded += n as u64;
    }
}
