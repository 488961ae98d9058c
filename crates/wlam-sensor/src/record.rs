//! Aggregated uplink record and its bitmap-tagged wire format.
//!
//! ```text
//! +-------------------+----------+--------------+------+-----+-----+---------+
//! | node id (base B)  | presence | created_at   | temp | no2 | hum | counter |
//! | utf-8, 0-padded   | u8       | u64 µs LE    | f64  | f64 | f64 | C bytes |
//! +-------------------+----------+--------------+------+-----+-----+---------+
//! ```
//!
//! Only the fields whose presence bit is set are written, so the size is
//! `B + 1 + 8 + 8·floats + (C if counter)`.

use crate::quantity::{Presence, Quantity};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use wlam_common::SimTime;

/// Bytes of the presence bitmap.
pub const PRESENCE_BYTES: usize = 1;
/// Bytes of the creation timestamp.
pub const TIMESTAMP_BYTES: usize = 8;
/// Bytes of each present float field.
pub const FLOAT_FIELD_BYTES: usize = 8;

/// Errors decoding a record.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    /// Buffer length does not match the size implied by the header.
    #[error("record length {actual} does not match expected {expected}")]
    Length {
        /// Size implied by the presence bitmap.
        expected: usize,
        /// Size of the buffer.
        actual: usize,
    },

    /// Presence byte carries bits outside the known quantities.
    #[error("unknown presence bits {0:#04x}")]
    UnknownPresence(u8),

    /// Node id is not valid UTF-8.
    #[error("node id is not valid utf-8")]
    InvalidNodeId,
}

/// Fixed sizes of the variable-length record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireLayout {
    /// Bytes reserved for the node id.
    pub base_payload_bytes: usize,
    /// Bytes of the counter field when present.
    pub counter_payload_bytes: usize,
}

impl Default for WireLayout {
    fn default() -> Self {
        Self {
            base_payload_bytes: 10,
            counter_payload_bytes: 4,
        }
    }
}

impl WireLayout {
    /// Size of a record with the given presence bitmap.
    pub fn size_for(&self, presence: Presence) -> usize {
        let counter = if presence.contains(Presence::COUNTER) {
            self.counter_payload_bytes
        } else {
            0
        };
        self.header_bytes() + presence.float_fields() * FLOAT_FIELD_BYTES + counter
    }

    fn header_bytes(&self) -> usize {
        self.base_payload_bytes + PRESENCE_BYTES + TIMESTAMP_BYTES
    }
}

/// One uplink's worth of readings.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRecord {
    /// Name of the sending node.
    pub node_id: String,
    /// Time the record was built.
    pub created_at: SimTime,
    temperature: Option<f64>,
    no2: Option<f64>,
    humidity: Option<f64>,
    counter: Option<u64>,
}

impl OutboundRecord {
    /// Empty record.
    pub fn new(node_id: impl Into<String>, created_at: SimTime) -> Self {
        Self {
            node_id: node_id.into(),
            created_at,
            temperature: None,
            no2: None,
            humidity: None,
            counter: None,
        }
    }

    /// Set a float field. A later reading of the same quantity replaces the earlier one.
    pub fn set_reading(&mut self, quantity: Quantity, value: f64) {
        match quantity {
            Quantity::Temperature => self.temperature = Some(value),
            Quantity::No2 => self.no2 = Some(value),
            Quantity::Humidity => self.humidity = Some(value),
            Quantity::Counter => self.counter = Some(value as u64),
        }
    }

    /// Set the counter field.
    pub fn set_counter(&mut self, value: u64) {
        self.counter = Some(value);
    }

    /// Float field of a quantity, if present.
    pub fn reading(&self, quantity: Quantity) -> Option<f64> {
        match quantity {
            Quantity::Temperature => self.temperature,
            Quantity::No2 => self.no2,
            Quantity::Humidity => self.humidity,
            Quantity::Counter => self.counter.map(|c| c as f64),
        }
    }

    /// Counter field, if present.
    pub fn counter(&self) -> Option<u64> {
        self.counter
    }

    /// Presence bitmap.
    pub fn presence(&self) -> Presence {
        Quantity::ALL
            .into_iter()
            .filter(|q| self.is_present(*q))
            .fold(Presence::empty(), |acc, q| acc | q.presence())
    }

    /// Whether a quantity is present.
    pub fn is_present(&self, quantity: Quantity) -> bool {
        match quantity {
            Quantity::Counter => self.counter.is_some(),
            q => self.reading(q).is_some(),
        }
    }

    /// Whether no field is present.
    pub fn is_empty(&self) -> bool {
        self.presence().is_empty()
    }

    /// Exact size on the wire.
    pub fn wire_size(&self, layout: &WireLayout) -> usize {
        layout.size_for(self.presence())
    }

    /// Serialize to exactly [`wire_size`](Self::wire_size) bytes.
    pub fn encode(&self, layout: &WireLayout) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.wire_size(layout));

        let id = truncate_utf8(&self.node_id, layout.base_payload_bytes);
        buf.extend_from_slice(id.as_bytes());
        buf.resize(layout.base_payload_bytes, 0);

        buf.push(self.presence().bits());
        buf.extend_from_slice(&self.created_at.as_micros().to_le_bytes());

        for value in [self.temperature, self.no2, self.humidity].into_iter().flatten() {
            buf.extend_from_slice(&value.to_le_bytes());
        }

        if let Some(counter) = self.counter {
            let bytes = counter.to_le_bytes();
            for i in 0..layout.counter_payload_bytes {
                buf.push(bytes.get(i).copied().unwrap_or(0));
            }
        }

        buf
    }

    /// Parse a buffer produced by [`encode`](Self::encode) with the same layout.
    pub fn decode(bytes: &[u8], layout: &WireLayout) -> Result<Self, RecordError> {
        let header = layout.header_bytes();
        if bytes.len() < header {
            return Err(RecordError::Length {
                expected: header,
                actual: bytes.len(),
            });
        }

        let (id_bytes, rest) = bytes.split_at(layout.base_payload_bytes);
        let id_len = id_bytes.iter().position(|b| *b == 0).unwrap_or(id_bytes.len());
        let node_id = std::str::from_utf8(&id_bytes[..id_len])
            .map_err(|_| RecordError::InvalidNodeId)?
            .to_string();

        let presence = Presence::from_bits(rest[0]).ok_or(RecordError::UnknownPresence(rest[0]))?;
        let expected = layout.size_for(presence);
        if bytes.len() != expected {
            return Err(RecordError::Length {
                expected,
                actual: bytes.len(),
            });
        }

        let mut cursor = &rest[PRESENCE_BYTES..];
        let created_at = SimTime::from_micros(u64::from_le_bytes(take_array(&mut cursor)));
        let mut record = OutboundRecord::new(node_id, created_at);

        for q in [Quantity::Temperature, Quantity::No2, Quantity::Humidity] {
            if presence.contains(q.presence()) {
                record.set_reading(q, f64::from_le_bytes(take_array(&mut cursor)));
            }
        }

        if presence.contains(Presence::COUNTER) {
            let mut raw = [0u8; 8];
            for (dst, src) in raw.iter_mut().zip(cursor.iter()) {
                *dst = *src;
            }
            record.set_counter(u64::from_le_bytes(raw));
        }

        Ok(record)
    }
}

/// Longest prefix of `s` that fits in `max` bytes without splitting a character.
fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Read 8 bytes from the front of `cursor`. Length is checked by the caller.
fn take_array(cursor: &mut &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&cursor[..8]);
    *cursor = &cursor[8..];
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> WireLayout {
        WireLayout::default()
    }

    #[test]
    fn test_wire_size_examples() {
        let t = SimTime::from_secs(60.0);

        let mut no2 = OutboundRecord::new("node", t);
        no2.set_reading(Quantity::No2, 21.0);
        assert_eq!(no2.wire_size(&layout()), 27);

        let mut no2_hum = no2.clone();
        no2_hum.set_reading(Quantity::Humidity, 55.0);
        assert_eq!(no2_hum.wire_size(&layout()), 35);

        let mut counter = OutboundRecord::new("node", t);
        counter.set_counter(1);
        assert_eq!(counter.wire_size(&layout()), 23);

        let mut all = no2_hum.clone();
        all.set_reading(Quantity::Temperature, 20.0);
        all.set_counter(9);
        assert_eq!(all.presence(), Presence::all());
        assert_eq!(all.wire_size(&layout()), 10 + 1 + 8 + 24 + 4);
    }

    #[test]
    fn test_size_depends_only_on_presence() {
        let custom = WireLayout {
            base_payload_bytes: 3,
            counter_payload_bytes: 2,
        };
        let mut a = OutboundRecord::new("a-much-longer-name", SimTime::ZERO);
        let mut b = OutboundRecord::new("b", SimTime::from_secs(9999.0));
        a.set_reading(Quantity::Temperature, -3.0);
        a.set_counter(u64::MAX);
        b.set_reading(Quantity::Temperature, 40.0);
        b.set_counter(0);
        assert_eq!(a.wire_size(&custom), b.wire_size(&custom));
        assert_eq!(a.wire_size(&custom), 3 + 1 + 8 + 8 + 2);
    }

    #[test]
    fn test_encode_layout() {
        let mut record = OutboundRecord::new("s1", SimTime::from_micros(0x0102));
        record.set_reading(Quantity::Humidity, 1.5);
        record.set_counter(0x0A0B_0C0D_0E0F);
        let bytes = record.encode(&layout());

        assert_eq!(bytes.len(), record.wire_size(&layout()));
        assert_eq!(&bytes[..10], b"s1\0\0\0\0\0\0\0\0");
        assert_eq!(bytes[10], 0x0C);
        assert_eq!(&bytes[11..19], &[0x02, 0x01, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&bytes[19..27], &1.5f64.to_le_bytes());
        // counter keeps its 4 low bytes
        assert_eq!(&bytes[27..], &[0x0F, 0x0E, 0x0D, 0x0C]);
    }

    #[test]
    fn test_decode_restores_fields() {
        let mut record = OutboundRecord::new("loRaNodes[0]", SimTime::from_secs(3600.0));
        record.set_reading(Quantity::Temperature, 21.25);
        record.set_reading(Quantity::Humidity, 63.5);
        let bytes = record.encode(&layout());

        let decoded = OutboundRecord::decode(&bytes, &layout()).unwrap();
        // node id is cut to the reserved width
        assert_eq!(decoded.node_id, "loRaNodes[");
        assert_eq!(decoded.created_at, record.created_at);
        assert_eq!(decoded.reading(Quantity::Temperature), Some(21.25));
        assert_eq!(decoded.reading(Quantity::Humidity), Some(63.5));
        assert_eq!(decoded.reading(Quantity::No2), None);
        assert_eq!(decoded.presence(), Presence::TEMPERATURE | Presence::HUMIDITY);
    }

    #[test]
    fn test_long_names_share_an_id_field() {
        let at = SimTime::from_secs(60.0);
        let a = OutboundRecord::new("loRaNodes[3]", at).encode(&layout());
        let b = OutboundRecord::new("loRaNodes[17]", at).encode(&layout());
        // only the first base_payload_bytes of the name travel
        assert_eq!(a[..layout().base_payload_bytes], b[..layout().base_payload_bytes]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_decode_wide_counter() {
        let wide = WireLayout {
            base_payload_bytes: 2,
            counter_payload_bytes: 10,
        };
        let mut record = OutboundRecord::new("x", SimTime::ZERO);
        record.set_counter(u64::MAX - 1);
        let bytes = record.encode(&wide);
        assert_eq!(bytes.len(), 2 + 1 + 8 + 10);
        assert_eq!(&bytes[bytes.len() - 2..], &[0, 0]);
        assert_eq!(OutboundRecord::decode(&bytes, &wide).unwrap().counter(), Some(u64::MAX - 1));
    }

    #[test]
    fn test_decode_rejects_bad_input() {
        let mut record = OutboundRecord::new("n", SimTime::ZERO);
        record.set_reading(Quantity::No2, 1.0);
        let bytes = record.encode(&layout());

        assert_eq!(
            OutboundRecord::decode(&bytes[..26], &layout()),
            Err(RecordError::Length { expected: 27, actual: 26 })
        );
        assert_eq!(
            OutboundRecord::decode(&bytes[..5], &layout()),
            Err(RecordError::Length { expected: 19, actual: 5 })
        );

        let mut bad = bytes.clone();
        bad[10] = 0x30;
        assert_eq!(OutboundRecord::decode(&bad, &layout()), Err(RecordError::UnknownPresence(0x30)));
    }

    #[test]
    fn test_truncate_respects_char_boundary() {
        assert_eq!(truncate_utf8("né", 2), "n");
        assert_eq!(truncate_utf8("abc", 8), "abc");
    }
}
