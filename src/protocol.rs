//! MIoT wire protocol implementation.
//! Handles LAN UDP framing with MD5 integrity tags, discovery probes and the
//! length-prefixed envelope carried over the local hub broker.

use crate::crypto::{LanCipher, md5};
use crate::error::{MiotError, Result};
use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};

pub const MAGIC: u16 = 0x2131;
pub const HEADER_LEN: usize = 32;
pub const PROBE_LEN: usize = 32;
pub const LAN_PORT: u16 = 54321;
pub const MAX_FRAME_LEN: usize = 1400;

const PROBE_MARKER: &[u8; 4] = b"MDID";
const SUB_MARKER: &[u8; 4] = b"MSUB";
const PUB_MARKER: &[u8; 3] = b"PUB";
const WILDCARD_SUPPORTED: u8 = 0xFE;

// -------------------------------------------------------------------------
// LAN frame
// -------------------------------------------------------------------------

/// Fixed 32-byte header in front of every LAN datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanHeader {
    /// Total frame length, header included
    pub length: u16,
    /// Sender or addressee device id
    pub did: u64,
    /// Device clock (inbound) or device clock estimate (outbound)
    pub timestamp: u32,
    /// MD5 integrity tag, token, or probe filler depending on the frame kind
    pub tag: [u8; 16],
}

/// Parse the LAN header from binary data.
pub fn parse_header(data: &[u8]) -> Result<LanHeader> {
    if data.len() < HEADER_LEN {
        return Err(MiotError::MalformedFrame(format!(
            "frame too short: {} bytes",
            data.len()
        )));
    }

    let mut cursor = Cursor::new(data);
    let magic = cursor.read_u16::<BigEndian>()?;
    if magic != MAGIC {
        return Err(MiotError::MalformedFrame(format!("bad magic {:#06x}", magic)));
    }
    let length = cursor.read_u16::<BigEndian>()?;
    let did = cursor.read_u64::<BigEndian>()?;
    let timestamp = cursor.read_u32::<BigEndian>()?;
    let mut tag = [0u8; 16];
    cursor.read_exact(&mut tag)?;

    if (length as usize) < HEADER_LEN || length as usize > data.len() {
        return Err(MiotError::MalformedFrame(format!(
            "length field {} does not fit datagram of {} bytes",
            length,
            data.len()
        )));
    }

    Ok(LanHeader {
        length,
        did,
        timestamp,
        tag,
    })
}

/// Pack an encrypted control frame addressed to `did`.
///
/// The token is written into the tag field, the MD5 of the whole frame is
/// computed and then stored over it.
pub fn pack_frame(cipher: &LanCipher, did: u64, timestamp: u32, payload: &[u8]) -> Result<Vec<u8>> {
    let encrypted = cipher.encrypt(payload);
    let total = HEADER_LEN + encrypted.len();
    if total > MAX_FRAME_LEN {
        return Err(MiotError::InvalidParams(format!(
            "frame of {} bytes exceeds {}",
            total, MAX_FRAME_LEN
        )));
    }

    let mut data = Vec::with_capacity(total);
    data.write_u16::<BigEndian>(MAGIC)?;
    data.write_u16::<BigEndian>(total as u16)?;
    data.write_u64::<BigEndian>(did)?;
    data.write_u32::<BigEndian>(timestamp)?;
    data.extend_from_slice(cipher.token());
    data.extend_from_slice(&encrypted);

    let digest = md5(&[&data[..]]);
    data[16..32].copy_from_slice(&digest);
    Ok(data)
}

/// Verify the integrity tag of a control frame and decrypt its payload.
pub fn unpack_frame(cipher: &LanCipher, data: &[u8]) -> Result<Vec<u8>> {
    let header = parse_header(data)?;
    let length = header.length as usize;
    if length <= HEADER_LEN {
        return Err(MiotError::MalformedFrame("frame carries no payload".into()));
    }

    let mut frame = data[..length].to_vec();
    frame[16..32].copy_from_slice(cipher.token());
    if md5(&[&frame[..]]) != header.tag {
        return Err(MiotError::IntegrityCheckFailed);
    }
    cipher.decrypt(&frame[HEADER_LEN..])
}

// -------------------------------------------------------------------------
// Discovery probe
// -------------------------------------------------------------------------

/// Build the 32-byte probe sent by the controller, carrying its virtual did.
pub fn build_probe(virtual_did: u64) -> [u8; PROBE_LEN] {
    let mut probe = [0xFFu8; PROBE_LEN];
    BigEndian::write_u16(&mut probe[0..2], MAGIC);
    BigEndian::write_u16(&mut probe[2..4], PROBE_LEN as u16);
    probe[16..20].copy_from_slice(PROBE_MARKER);
    BigEndian::write_u64(&mut probe[20..28], virtual_did);
    probe[28..32].fill(0);
    probe
}

/// Subscription beacon a device embeds in its probe reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeBeacon {
    /// Device-side subscription epoch; changes when the device restarts its subscriptions
    pub epoch: u32,
    pub sub_type: u8,
    pub wildcard: bool,
}

impl SubscribeBeacon {
    /// Whether a controller may rely on wildcard push for this beacon.
    pub fn accepts_wildcard(&self) -> bool {
        self.wildcard && matches!(self.sub_type, 0 | 1 | 4)
    }
}

/// Extract the subscription beacon from a probe-sized frame, if present.
pub fn parse_beacon(data: &[u8]) -> Option<SubscribeBeacon> {
    if data.len() != PROBE_LEN || &data[16..20] != SUB_MARKER || &data[24..27] != PUB_MARKER {
        return None;
    }
    Some(SubscribeBeacon {
        epoch: BigEndian::read_u32(&data[20..24]),
        sub_type: data[27],
        wildcard: data[28] == WILDCARD_SUPPORTED,
    })
}

/// Build a probe reply as a device would send it. Used by device simulators.
pub fn build_probe_reply(did: u64, timestamp: u32, beacon: Option<SubscribeBeacon>) -> [u8; PROBE_LEN] {
    let mut reply = [0u8; PROBE_LEN];
    BigEndian::write_u16(&mut reply[0..2], MAGIC);
    BigEndian::write_u16(&mut reply[2..4], PROBE_LEN as u16);
    BigEndian::write_u64(&mut reply[4..12], did);
    BigEndian::write_u32(&mut reply[12..16], timestamp);
    if let Some(b) = beacon {
        reply[16..20].copy_from_slice(SUB_MARKER);
        BigEndian::write_u32(&mut reply[20..24], b.epoch);
        reply[24..27].copy_from_slice(PUB_MARKER);
        reply[27] = b.sub_type;
        if b.wildcard {
            reply[28] = WILDCARD_SUPPORTED;
        }
    }
    reply
}

// -------------------------------------------------------------------------
// Hub envelope
// -------------------------------------------------------------------------

define_field_type! {
    /// Tag of a field inside the hub envelope.
    pub enum FieldType {
        Id = 0,
        RetTopic = 1,
        Payload = 2,
        From = 3,
    }
}

/// Message exchanged with a local hub broker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    pub mid: u32,
    pub from: Option<String>,
    pub ret_topic: Option<String>,
    pub payload: Option<String>,
}

impl Envelope {
    /// Pack into `(u32 LE length, u8 type, bytes)` tuples.
    pub fn pack(&self) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        data.write_u32::<LittleEndian>(4)?;
        data.write_u8(FieldType::Id as u8)?;
        data.write_u32::<LittleEndian>(self.mid)?;

        for (kind, value) in [
            (FieldType::From, &self.from),
            (FieldType::RetTopic, &self.ret_topic),
            (FieldType::Payload, &self.payload),
        ] {
            if let Some(s) = value {
                data.write_u32::<LittleEndian>(s.len() as u32 + 1)?;
                data.write_u8(kind as u8)?;
                data.extend_from_slice(s.as_bytes());
                data.push(0);
            }
        }
        Ok(data)
    }

    /// Unpack an envelope. Field order is free, unknown field types are skipped.
    pub fn unpack(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let mut mid = None;
        let mut msg = Envelope::default();

        while (cursor.position() as usize) < data.len() {
            let len = cursor
                .read_u32::<LittleEndian>()
                .map_err(|_| MiotError::MalformedFrame("truncated field header".into()))?
                as usize;
            let kind = cursor
                .read_u8()
                .map_err(|_| MiotError::MalformedFrame("truncated field header".into()))?;
            let start = cursor.position() as usize;
            let end = start
                .checked_add(len)
                .filter(|end| *end <= data.len())
                .ok_or_else(|| MiotError::MalformedFrame(format!("field of {} bytes overruns frame", len)))?;
            let body = &data[start..end];
            cursor.set_position(end as u64);

            match FieldType::from_u8(kind) {
                Some(FieldType::Id) => {
                    if body.len() != 4 {
                        return Err(MiotError::MalformedFrame("id field must be 4 bytes".into()));
                    }
                    mid = Some(LittleEndian::read_u32(body));
                }
                Some(FieldType::RetTopic) => msg.ret_topic = Some(field_string(body)?),
                Some(FieldType::Payload) => msg.payload = Some(field_string(body)?),
                Some(FieldType::From) => msg.from = Some(field_string(body)?),
                None => {}
            }
        }

        msg.mid = mid.ok_or_else(|| MiotError::MalformedFrame("missing message id".into()))?;
        Ok(msg)
    }
}

fn field_string(body: &[u8]) -> Result<String> {
    let text = std::str::from_utf8(body)
        .map_err(|_| MiotError::MalformedFrame("field is not utf-8".into()))?;
    Ok(text.trim_matches('\0').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN: &str = "00112233445566778899aabbccddeeff";

    #[test]
    fn probe_layout() {
        let probe = build_probe(0x1122334455667788);
        assert_eq!(&probe[..4], &[0x21, 0x31, 0x00, 0x20]);
        assert!(probe[4..16].iter().all(|b| *b == 0xFF));
        assert_eq!(&probe[16..20], b"MDID");
        assert_eq!(&probe[20..28], &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]);
        assert_eq!(&probe[28..], &[0, 0, 0, 0]);
        assert!(parse_header(&probe).is_ok());
    }

    #[test]
    fn frame_carries_did_and_payload() {
        let cipher = LanCipher::from_hex(TOKEN).unwrap();
        let payload = br#"{"id":7,"method":"get_properties","params":[]}"#;
        let frame = pack_frame(&cipher, 123456789, 1000, payload).unwrap();

        let header = parse_header(&frame).unwrap();
        assert_eq!(header.did, 123456789);
        assert_eq!(header.timestamp, 1000);
        assert_eq!(header.length as usize, frame.len());
        assert_ne!(&header.tag, cipher.token());
        assert_eq!(unpack_frame(&cipher, &frame).unwrap(), payload);
    }

    #[test]
    fn short_or_foreign_frames_fail_closed() {
        assert!(matches!(parse_header(&[0x21, 0x31, 0, 4]), Err(MiotError::MalformedFrame(_))));
        let mut probe = build_probe(1);
        probe[0] = 0x55;
        assert!(matches!(parse_header(&probe), Err(MiotError::MalformedFrame(_))));

        let cipher = LanCipher::from_hex(TOKEN).unwrap();
        let mut frame = pack_frame(&cipher, 1, 0, b"{}").unwrap();
        frame[3] = 0xFF;
        assert!(matches!(unpack_frame(&cipher, &frame), Err(MiotError::MalformedFrame(_))));
    }

    #[test]
    fn tampered_or_wrong_token_fails_integrity() {
        let cipher = LanCipher::from_hex(TOKEN).unwrap();
        let other = LanCipher::from_hex("ffeeddccbbaa99887766554433221100").unwrap();
        let frame = pack_frame(&cipher, 42, 0, b"{\"id\":1}").unwrap();
        assert_eq!(unpack_frame(&other, &frame), Err(MiotError::IntegrityCheckFailed));

        let mut tampered = frame.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x01;
        assert_eq!(unpack_frame(&cipher, &tampered), Err(MiotError::IntegrityCheckFailed));
    }

    #[test]
    fn beacon_is_read_from_probe_reply() {
        let beacon = SubscribeBeacon {
            epoch: 77,
            sub_type: 1,
            wildcard: true,
        };
        let reply = build_probe_reply(99, 5, Some(beacon));
        assert_eq!(parse_header(&reply).unwrap().did, 99);
        let parsed = parse_beacon(&reply).unwrap();
        assert_eq!(parsed, beacon);
        assert!(parsed.accepts_wildcard());
        assert!(parse_beacon(&build_probe_reply(99, 5, None)).is_none());
    }

    #[test]
    fn envelope_fields_in_any_order() {
        let msg = Envelope {
            mid: 0xDEADBEEF,
            from: Some("local".into()),
            ret_topic: Some("123/reply".into()),
            payload: Some("{\"did\":\"1\"}".into()),
        };
        let packed = msg.pack().unwrap();
        assert_eq!(&packed[..5], &[4, 0, 0, 0, 0]);
        assert_eq!(Envelope::unpack(&packed).unwrap(), msg);

        // payload first, unknown type 9, id last, no origin
        let mut raw = Vec::new();
        raw.extend_from_slice(&[3, 0, 0, 0, 2]);
        raw.extend_from_slice(b"{}\0");
        raw.extend_from_slice(&[2, 0, 0, 0, 9, 0xAA, 0xBB]);
        raw.extend_from_slice(&[4, 0, 0, 0, 0, 1, 0, 0, 0]);
        let parsed = Envelope::unpack(&raw).unwrap();
        assert_eq!(parsed.mid, 1);
        assert_eq!(parsed.payload.as_deref(), Some("{}"));
        assert_eq!(parsed.from, None);
        assert_eq!(parsed.ret_topic, None);
    }

    #[test]
    fn envelope_rejects_overruns_and_missing_id() {
        assert!(Envelope::unpack(&[10, 0, 0, 0, 2, b'{']).is_err());
        assert!(Envelope::unpack(&[3, 0, 0, 0, 2, b'{', b'}', 0]).is_err());
        assert!(Envelope::unpack(&[4, 0, 0]).is_err());
    }
}
