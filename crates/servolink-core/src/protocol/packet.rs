//! Packet encoding/decoding
//!
//! Stateless transformation between `(id, instruction, params)` and the
//! transmittable byte frame, and the inverse for received status frames.
//!
//! Protocol 1.0 frame:
//! - `FF FF <ID> <LEN> <INST> <PARAM..> <CHK>`, LEN = params + 2,
//!   CHK = ones complement of the sum over ID..params.
//!
//! Protocol 2.0 frame:
//! - `FF FF FD 00 <ID> <LEN_L> <LEN_H> <INST> <PARAM..> <CRC_L> <CRC_H>`,
//!   LEN = stuffed params + 3, CRC-16 (0x8005, init 0) over every byte
//!   before the CRC field. Any in-payload `FF FF FD` is broken up by an
//!   inserted `FD` so receivers never mistake payload for a header.

use byteorder::{ByteOrder, LittleEndian};
use crc16::{State, BUYPASS};

use super::{Instruction, ProtocolVersion};
use crate::error::{CommError, CommResult, DeviceError};

const HEADER_V1: [u8; 2] = [0xFF, 0xFF];
const HEADER_V2: [u8; 4] = [0xFF, 0xFF, 0xFD, 0x00];

/// An instruction packet ready for encoding.
#[derive(Debug, Clone)]
pub struct InstructionPacket {
    /// Target device ID (or [`super::BROADCAST_ID`]).
    pub id: u8,
    /// Instruction to execute.
    pub instruction: Instruction,
    /// Parameter bytes, unstuffed.
    pub params: Vec<u8>,
}

impl InstructionPacket {
    /// Build a packet from its parts.
    pub fn new(id: u8, instruction: Instruction, params: Vec<u8>) -> Self {
        Self {
            id,
            instruction,
            params,
        }
    }

    /// Encode into a transmittable frame.
    ///
    /// Fails with [`CommError::TxError`] when the frame would exceed the
    /// per-version maximum length.
    pub fn encode(&self, protocol: ProtocolVersion) -> CommResult<Vec<u8>> {
        match protocol {
            ProtocolVersion::V1 => self.encode_v1(),
            ProtocolVersion::V2 => self.encode_v2(),
        }
    }

    fn encode_v1(&self) -> CommResult<Vec<u8>> {
        let total = self.params.len() + 6;
        if total > ProtocolVersion::V1.max_packet_len() {
            return Err(CommError::TxError);
        }

        let mut buf = Vec::with_capacity(total);
        buf.extend_from_slice(&HEADER_V1);
        buf.push(self.id);
        buf.push((self.params.len() + 2) as u8);
        buf.push(self.instruction.code());
        buf.extend_from_slice(&self.params);
        buf.push(checksum_v1(&buf[2..]));
        Ok(buf)
    }

    fn encode_v2(&self) -> CommResult<Vec<u8>> {
        let stuffed = add_stuffing(&self.params);
        let length = stuffed.len() + 3;
        let total = length + 7;
        if total > ProtocolVersion::V2.max_packet_len() {
            return Err(CommError::TxError);
        }

        let mut buf = Vec::with_capacity(total);
        buf.extend_from_slice(&HEADER_V2);
        buf.push(self.id);
        let mut len_bytes = [0u8; 2];
        LittleEndian::write_u16(&mut len_bytes, length as u16);
        buf.extend_from_slice(&len_bytes);
        buf.push(self.instruction.code());
        buf.extend_from_slice(&stuffed);

        let crc = crc16_ibm(&buf);
        let mut crc_bytes = [0u8; 2];
        LittleEndian::write_u16(&mut crc_bytes, crc);
        buf.extend_from_slice(&crc_bytes);
        Ok(buf)
    }
}

/// A decoded status packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusPacket {
    /// Responding device ID.
    pub id: u8,
    /// Error byte the device reported.
    pub error: DeviceError,
    /// Parameter payload, destuffed.
    pub params: Vec<u8>,
}

impl StatusPacket {
    /// Build a status packet from its parts.
    pub fn new(id: u8, error: DeviceError, params: Vec<u8>) -> Self {
        Self { id, error, params }
    }

    /// Encode into a status frame — the device side of the link.
    ///
    /// The engine only ever decodes status packets; this direction exists
    /// for simulators scripting a [`crate::port::MockPort`] and for tests.
    pub fn encode(&self, protocol: ProtocolVersion) -> Vec<u8> {
        match protocol {
            ProtocolVersion::V1 => {
                let mut buf = vec![
                    0xFF,
                    0xFF,
                    self.id,
                    (self.params.len() + 2) as u8,
                    self.error.raw(),
                ];
                buf.extend_from_slice(&self.params);
                buf.push(checksum_v1(&buf[2..]));
                buf
            }
            ProtocolVersion::V2 => {
                let mut payload = vec![self.error.raw()];
                payload.extend_from_slice(&self.params);
                let stuffed = add_stuffing(&payload);
                let length = (stuffed.len() + 3) as u16;
                let mut buf = vec![0xFF, 0xFF, 0xFD, 0x00, self.id];
                let mut len_bytes = [0u8; 2];
                LittleEndian::write_u16(&mut len_bytes, length);
                buf.extend_from_slice(&len_bytes);
                buf.push(Instruction::Status.code());
                buf.extend_from_slice(&stuffed);
                let crc = crc16_ibm(&buf);
                let mut crc_bytes = [0u8; 2];
                LittleEndian::write_u16(&mut crc_bytes, crc);
                buf.extend_from_slice(&crc_bytes);
                buf
            }
        }
    }
}

/// Decode a complete status frame.
///
/// The slice must hold exactly one frame: a declared length that disagrees
/// with the byte count, a malformed header, or a checksum/CRC mismatch all
/// yield [`CommError::RxCorrupt`].
pub fn decode_status(protocol: ProtocolVersion, buf: &[u8]) -> CommResult<StatusPacket> {
    match protocol {
        ProtocolVersion::V1 => decode_status_v1(buf),
        ProtocolVersion::V2 => decode_status_v2(buf),
    }
}

fn decode_status_v1(buf: &[u8]) -> CommResult<StatusPacket> {
    if buf.len() < ProtocolVersion::V1.min_status_len() || buf[..2] != HEADER_V1 {
        return Err(CommError::RxCorrupt);
    }
    let length = buf[3] as usize;
    let total = length + 4;
    if length < 2 || total != buf.len() {
        return Err(CommError::RxCorrupt);
    }
    if checksum_v1(&buf[2..total - 1]) != buf[total - 1] {
        return Err(CommError::RxCorrupt);
    }

    Ok(StatusPacket {
        id: buf[2],
        error: DeviceError::from_raw(buf[4]),
        params: buf[5..total - 1].to_vec(),
    })
}

fn decode_status_v2(buf: &[u8]) -> CommResult<StatusPacket> {
    if buf.len() < ProtocolVersion::V2.min_status_len() || buf[..4] != HEADER_V2 {
        return Err(CommError::RxCorrupt);
    }
    let length = LittleEndian::read_u16(&buf[5..7]) as usize;
    let total = length + 7;
    if length < 4 || total != buf.len() {
        return Err(CommError::RxCorrupt);
    }
    if buf[7] != Instruction::Status.code() {
        return Err(CommError::RxCorrupt);
    }
    let crc = LittleEndian::read_u16(&buf[total - 2..]);
    if crc16_ibm(&buf[..total - 2]) != crc {
        return Err(CommError::RxCorrupt);
    }

    // Error byte and parameters travel in the stuffed region together.
    let payload = remove_stuffing(&buf[8..total - 2]);
    Ok(StatusPacket {
        id: buf[4],
        error: DeviceError::from_raw(payload[0]),
        params: payload[1..].to_vec(),
    })
}

/// Ones-complement checksum over ID, length, instruction and parameters.
pub fn checksum_v1(bytes: &[u8]) -> u8 {
    let sum: u8 = bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    !sum
}

/// CRC-16 used by protocol 2.0 (polynomial 0x8005, init 0, no reflection).
pub fn crc16_ibm(bytes: &[u8]) -> u16 {
    State::<BUYPASS>::calculate(bytes)
}

/// Insert a `FD` after every in-payload `FF FF FD` so the sequence can never
/// be mistaken for a frame header.
pub fn add_stuffing(params: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(params.len());
    for &b in params {
        out.push(b);
        if out.len() >= 3 && out[out.len() - 3..] == [0xFF, 0xFF, 0xFD] {
            out.push(0xFD);
        }
    }
    out
}

/// Inverse of [`add_stuffing`]: drop the `FD` following each `FF FF FD`.
pub fn remove_stuffing(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        out.push(data[i]);
        let n = out.len();
        if n >= 3 && out[n - 3..] == [0xFF, 0xFF, 0xFD] && data.get(i + 1) == Some(&0xFD) {
            i += 2;
        } else {
            i += 1;
        }
    }
    out
}

/// Find the first plausible status-frame header in `buf`.
///
/// Protocol 2.0 additionally requires the byte after `FF FF FD` not to be
/// another `FD` — that pattern is stuffed payload, not a header.
pub fn find_header(protocol: ProtocolVersion, buf: &[u8]) -> Option<usize> {
    match protocol {
        ProtocolVersion::V1 => buf.windows(2).position(|w| w == HEADER_V1),
        ProtocolVersion::V2 => buf
            .windows(4)
            .position(|w| w[..3] == [0xFF, 0xFF, 0xFD] && w[3] != 0xFD),
    }
}

/// Encode a 1/2/4-byte register value, little-endian.
///
/// Values wider than `len` bytes are truncated, matching device behavior.
pub fn encode_value(value: u32, len: usize) -> Vec<u8> {
    let mut bytes = [0u8; 4];
    LittleEndian::write_u32(&mut bytes, value);
    bytes[..len.min(4)].to_vec()
}

/// Reassemble a little-endian register value of 1, 2 or 4 bytes.
pub fn decode_value(bytes: &[u8]) -> u32 {
    match bytes.len() {
        1 => bytes[0] as u32,
        2 => LittleEndian::read_u16(bytes) as u32,
        4 => LittleEndian::read_u32(bytes),
        _ => 0,
    }
}

/// Reassemble a signed register value, sign-extending from the most
/// significant bit of the last byte.
pub fn decode_value_signed(bytes: &[u8]) -> i32 {
    match bytes.len() {
        1 => bytes[0] as i8 as i32,
        2 => LittleEndian::read_i16(bytes) as i32,
        4 => LittleEndian::read_i32(bytes),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn encode_status(protocol: ProtocolVersion, id: u8, error: u8, params: &[u8]) -> Vec<u8> {
        StatusPacket::new(id, DeviceError::from_raw(error), params.to_vec()).encode(protocol)
    }

    #[test]
    fn v1_checksum_golden() {
        // Read temperature (addr 0x2B, 1 byte) from ID 1: documented
        // example frame FF FF 01 04 02 2B 01 CC.
        let packet = InstructionPacket::new(1, Instruction::Read, vec![0x2B, 0x01]);
        let bytes = packet.encode(ProtocolVersion::V1).unwrap();
        assert_eq!(bytes, vec![0xFF, 0xFF, 0x01, 0x04, 0x02, 0x2B, 0x01, 0xCC]);
    }

    #[test]
    fn v2_crc_golden() {
        // Ping ID 1: documented example frame FF FF FD 00 01 03 00 01 19 4E.
        let packet = InstructionPacket::new(1, Instruction::Ping, vec![]);
        let bytes = packet.encode(ProtocolVersion::V2).unwrap();
        assert_eq!(
            bytes,
            vec![0xFF, 0xFF, 0xFD, 0x00, 0x01, 0x03, 0x00, 0x01, 0x19, 0x4E]
        );
        assert_eq!(crc16_ibm(&bytes[..8]), 0x4E19);
    }

    #[test]
    fn stuffing_roundtrip_with_embedded_header() {
        let params = vec![0x10, 0xFF, 0xFF, 0xFD, 0x20, 0xFF, 0xFF, 0xFD];
        let stuffed = add_stuffing(&params);
        // one stuffing byte per embedded pattern
        assert_eq!(stuffed.len(), params.len() + 2);
        assert_eq!(
            stuffed,
            vec![0x10, 0xFF, 0xFF, 0xFD, 0xFD, 0x20, 0xFF, 0xFF, 0xFD, 0xFD]
        );
        assert_eq!(remove_stuffing(&stuffed), params);
    }

    #[test]
    fn stuffing_leaves_clean_payload_alone() {
        let params = vec![0x01, 0x02, 0xFF, 0xFD, 0xFF, 0xFF, 0x00];
        assert_eq!(add_stuffing(&params), params);
        assert_eq!(remove_stuffing(&params), params);
    }

    #[test]
    fn status_roundtrip_v1() {
        let frame = encode_status(ProtocolVersion::V1, 7, 0x24, &[1, 2, 3]);
        let status = decode_status(ProtocolVersion::V1, &frame).unwrap();
        assert_eq!(status.id, 7);
        assert_eq!(status.error.raw(), 0x24);
        assert_eq!(status.params, vec![1, 2, 3]);
    }

    #[test]
    fn status_roundtrip_v2_with_stuffing() {
        let params = vec![0xFF, 0xFF, 0xFD, 0x42];
        let frame = encode_status(ProtocolVersion::V2, 3, 0, &params);
        let status = decode_status(ProtocolVersion::V2, &frame).unwrap();
        assert_eq!(status.id, 3);
        assert!(status.error.is_ok());
        assert_eq!(status.params, params);
    }

    #[test]
    fn status_roundtrip_random_payloads() {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let id: u8 = rng.gen_range(0..=252);
            let len: usize = rng.gen_range(0..64);
            let params: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            for protocol in [ProtocolVersion::V1, ProtocolVersion::V2] {
                let frame = encode_status(protocol, id, 0, &params);
                let status = decode_status(protocol, &frame).unwrap();
                assert_eq!(status.id, id);
                assert_eq!(status.params, params);
            }
        }
    }

    #[test]
    fn corrupt_crc_is_rejected() {
        let mut frame = encode_status(ProtocolVersion::V2, 1, 0, &[9, 9]);
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        assert_eq!(
            decode_status(ProtocolVersion::V2, &frame),
            Err(CommError::RxCorrupt)
        );
    }

    #[test]
    fn corrupt_checksum_is_rejected_v1() {
        let mut frame = encode_status(ProtocolVersion::V1, 1, 0, &[9, 9]);
        let last = frame.len() - 1;
        frame[last] = frame[last].wrapping_add(1);
        assert_eq!(
            decode_status(ProtocolVersion::V1, &frame),
            Err(CommError::RxCorrupt)
        );
    }

    #[test]
    fn declared_length_must_match_byte_count() {
        let mut frame = encode_status(ProtocolVersion::V2, 1, 0, &[1, 2, 3, 4]);
        frame.truncate(frame.len() - 1);
        assert_eq!(
            decode_status(ProtocolVersion::V2, &frame),
            Err(CommError::RxCorrupt)
        );

        let mut frame = encode_status(ProtocolVersion::V1, 1, 0, &[1, 2]);
        frame.push(0x00);
        assert_eq!(
            decode_status(ProtocolVersion::V1, &frame),
            Err(CommError::RxCorrupt)
        );
    }

    #[test]
    fn malformed_header_is_rejected() {
        let mut frame = encode_status(ProtocolVersion::V2, 1, 0, &[1]);
        frame[2] = 0x00;
        assert_eq!(
            decode_status(ProtocolVersion::V2, &frame),
            Err(CommError::RxCorrupt)
        );
    }

    #[test]
    fn header_search_skips_stuffed_pattern() {
        let buf = [0x00, 0xFF, 0xFF, 0xFD, 0xFD, 0xFF, 0xFF, 0xFD, 0x00];
        assert_eq!(find_header(ProtocolVersion::V2, &buf), Some(5));
        assert_eq!(find_header(ProtocolVersion::V1, &buf), Some(1));
    }

    #[test]
    fn value_encoding_roundtrip() {
        assert_eq!(encode_value(0x12345678, 4), vec![0x78, 0x56, 0x34, 0x12]);
        assert_eq!(encode_value(0x1234, 2), vec![0x34, 0x12]);
        assert_eq!(decode_value(&[0x78, 0x56, 0x34, 0x12]), 0x12345678);
        assert_eq!(decode_value(&[0xFF, 0xFF, 0xFF, 0xFF]), u32::MAX);
    }

    #[test]
    fn signed_values_sign_extend() {
        assert_eq!(decode_value_signed(&[0xFF]), -1);
        assert_eq!(decode_value_signed(&[0x00, 0x80]), i16::MIN as i32);
        assert_eq!(decode_value_signed(&[0xFE, 0xFF, 0xFF, 0xFF]), -2);
        assert_eq!(decode_value_signed(&[0x7F]), 127);
    }

    #[test]
    fn oversized_packet_is_tx_error() {
        let packet = InstructionPacket::new(1, Instruction::Write, vec![0; 300]);
        assert_eq!(packet.encode(ProtocolVersion::V1), Err(CommError::TxError));
        let packet = InstructionPacket::new(1, Instruction::Write, vec![0; 1100]);
        assert_eq!(packet.encode(ProtocolVersion::V2), Err(CommError::TxError));
    }
}
