// src/buffer.rs
//
// Fixed-capacity output buffer shared by the GVRET and ELM paths. Grounded
// on original_source/src/commbuffer.cpp (CommBuffer::sendBytesToBuffer,
// sendByteToBuffer, sendString, sendFrameToBuffer) for the truncate-whole-
// unit contract, and on the teacher's io/gvret/common.rs::encode_gvret_frame
// for the idiomatic Vec<u8>-builder shape of a binary frame encoder.

use crate::can::{CanFrame, CanFrameFd};

pub const WIFI_BUFF_SIZE: usize = 2048;

/// Command byte for a CAN FD frame capture, matching GvretCodec's reply
/// opcode space (PROTO_BUILD_FD_FRAME in the original firmware).
const PROTO_BUILD_FD_FRAME: u8 = 0x05;

#[derive(Debug)]
pub struct OutputBuffer {
    buf: Vec<u8>,
}

impl Default for OutputBuffer {
    fn default() -> Self {
        OutputBuffer { buf: Vec::with_capacity(WIFI_BUFF_SIZE) }
    }
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn available(&self) -> usize {
        self.buf.len()
    }

    pub fn room(&self) -> usize {
        WIFI_BUFF_SIZE - self.buf.len()
    }

    pub fn take_all(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    /// No-op if full.
    pub fn append_byte(&mut self, b: u8) {
        if self.buf.len() < WIFI_BUFF_SIZE {
            self.buf.push(b);
        }
    }

    /// Copies as much as fits; returns the count actually copied.
    pub fn append_bytes(&mut self, bytes: &[u8]) -> usize {
        let room = self.room();
        let to_copy = bytes.len().min(room);
        self.buf.extend_from_slice(&bytes[..to_copy]);
        to_copy
    }

    pub fn append_string(&mut self, s: &str) -> usize {
        self.append_bytes(s.as_bytes())
    }

    /// Appends a classic CAN frame capture record (binary or ASCII
    /// depending on `binary`). Either the whole record fits and is
    /// appended, or nothing is.
    pub fn append_frame(&mut self, frame: &CanFrame, bus: u8, timestamp_us: u32, binary: bool) {
        if binary {
            let record = encode_binary_classic(frame, bus, timestamp_us);
            if record.len() <= self.room() {
                self.buf.extend_from_slice(&record);
            }
        } else {
            let record = encode_ascii(frame.id, frame.extended, bus, frame.payload(), timestamp_us);
            if record.len() <= self.room() {
                self.buf.extend_from_slice(record.as_bytes());
            }
        }
    }

    pub fn append_frame_fd(&mut self, frame: &CanFrameFd, bus: u8, timestamp_us: u32, binary: bool) {
        if binary {
            let record = encode_binary_fd(frame, bus, timestamp_us);
            if record.len() <= self.room() {
                self.buf.extend_from_slice(&record);
            }
        } else {
            let record = encode_ascii(frame.id, frame.extended, bus, frame.payload(), timestamp_us);
            if record.len() <= self.room() {
                self.buf.extend_from_slice(record.as_bytes());
            }
        }
    }
}

fn id_with_extended_bit(id: u32, extended: bool) -> u32 {
    if extended {
        id | (1u32 << 31)
    } else {
        id
    }
}

/// `0xF1, 0x00, t0..t3, i0..i3, (length | (bus<<4)), d0..d(length-1), 0x00`
fn encode_binary_classic(frame: &CanFrame, bus: u8, timestamp_us: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + frame.length as usize);
    out.push(0xF1);
    out.push(0x00);
    out.extend_from_slice(&timestamp_us.to_le_bytes());
    out.extend_from_slice(&id_with_extended_bit(frame.id, frame.extended).to_le_bytes());
    out.push(frame.length | (bus << 4));
    out.extend_from_slice(frame.payload());
    out.push(0x00);
    out
}

/// `0xF1, 0x05, t0..t3, i0..i3, length, bus, d0..d(length-1), 0x00`
fn encode_binary_fd(frame: &CanFrameFd, bus: u8, timestamp_us: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(13 + frame.length as usize);
    out.push(0xF1);
    out.push(PROTO_BUILD_FD_FRAME);
    out.extend_from_slice(&timestamp_us.to_le_bytes());
    out.extend_from_slice(&id_with_extended_bit(frame.id, frame.extended).to_le_bytes());
    out.push(frame.length);
    out.push(bus);
    out.extend_from_slice(frame.payload());
    out.push(0x00);
    out
}

/// `"<micros> - <id_hex> <X|S> <bus_dec> <len_dec>[ <byte_hex>]*\r\n"`
fn encode_ascii(id: u32, extended: bool, bus: u8, payload: &[u8], timestamp_us: u32) -> String {
    let mut s = format!(
        "{} - {:x} {} {} {}",
        timestamp_us,
        id,
        if extended { "X" } else { "S" },
        bus,
        payload.len()
    );
    for b in payload {
        s.push_str(&format!(" {:x}", b));
    }
    s.push_str("\r\n");
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(id: u32, extended: bool, data: &[u8]) -> CanFrame {
        let mut d = [0u8; 8];
        d[..data.len()].copy_from_slice(data);
        CanFrame::new(id, extended, data.len() as u8, d)
    }

    #[test]
    fn binary_classic_layout_matches_spec() {
        let f = frame(0x123, false, &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]);
        let mut ob = OutputBuffer::new();
        ob.append_frame(&f, 0, 0x01020304, true);
        let bytes = ob.take_all();
        assert_eq!(bytes[0], 0xF1);
        assert_eq!(bytes[1], 0x00);
        assert_eq!(u32::from_le_bytes(bytes[2..6].try_into().unwrap()), 0x01020304);
        assert_eq!(u32::from_le_bytes(bytes[6..10].try_into().unwrap()), 0x123);
        assert_eq!(bytes[10], 8);
        assert_eq!(&bytes[11..19], &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]);
        assert_eq!(bytes[19], 0x00);
        assert_eq!(bytes.len(), 20);
    }

    #[test]
    fn extended_id_sets_bit_31() {
        let f = frame(0x1FFFF, true, &[]);
        let mut ob = OutputBuffer::new();
        ob.append_frame(&f, 2, 0, true);
        let bytes = ob.take_all();
        let id = u32::from_le_bytes(bytes[6..10].try_into().unwrap());
        assert_eq!(id & (1 << 31), 1 << 31);
        assert_eq!(id & 0x1FFF_FFFF, 0x1FFFF);
    }

    #[test]
    fn ascii_layout_uses_lowercase_minimal_hex() {
        let f = frame(0xAB, false, &[0x0A, 0xFF]);
        let mut ob = OutputBuffer::new();
        ob.append_frame(&f, 1, 100, false);
        let bytes = ob.take_all();
        let s = String::from_utf8(bytes).unwrap();
        assert_eq!(s, "100 - ab S 1 2 a ff\r\n");
    }

    #[test]
    fn frame_append_is_all_or_nothing_on_overflow() {
        let f = frame(0x1, false, &[1, 2, 3, 4, 5, 6, 7, 8]);
        let mut ob = OutputBuffer::new();
        // Fill buffer to within 10 bytes of capacity — a 20-byte binary
        // classic record cannot fit.
        ob.append_bytes(&vec![0u8; WIFI_BUFF_SIZE - 10]);
        let before = ob.available();
        ob.append_frame(&f, 0, 0, true);
        assert_eq!(ob.available(), before);
    }

    #[test]
    fn available_never_exceeds_capacity() {
        let mut ob = OutputBuffer::new();
        let huge = vec![0u8; WIFI_BUFF_SIZE * 2];
        let copied = ob.append_bytes(&huge);
        assert_eq!(copied, WIFI_BUFF_SIZE);
        assert_eq!(ob.available(), WIFI_BUFF_SIZE);
    }
}
