//! Fixed-size wire record carried over data channels
//!
//! Every record is exactly [`FRAME_SIZE`] bytes in native byte order, so a
//! reader can split a byte stream into frames without any length prefix:
//!
//! | field        | type      |
//! |--------------|-----------|
//! | sensor type  | `i32`     |
//! | version      | `i32`     |
//! | timestamp    | `i64`     |
//! | option       | `u32`     |
//! | mode         | `i32`     |
//! | payload      | `[u8; 64]`|
//! | payload len  | `u32`     |
//! | device id    | `i32`     |
//! | sensor index | `i32`     |
//! | locality     | `i32`     |

use bytes::{Buf, BufMut, Bytes, BytesMut};
use sensor_hal::{HalEvent, Locality, SensorIdentity, SensorType};

use crate::error::{ChannelError, Result};

/// Largest payload a single frame can carry
pub const MAX_PAYLOAD_LEN: usize = 64;

/// Encoded size of one [`EventFrame`]
pub const FRAME_SIZE: usize = 4 + 4 + 8 + 4 + 4 + MAX_PAYLOAD_LEN + 4 + 4 + 4 + 4;

/// One sensor reading as it travels to a subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventFrame {
    pub sensor_type: i32,
    pub version: i32,
    pub timestamp: i64,
    pub option: u32,
    pub mode: i32,
    pub payload: [u8; MAX_PAYLOAD_LEN],
    pub payload_len: u32,
    pub device_id: i32,
    pub sensor_index: i32,
    pub locality: i32,
}

impl EventFrame {
    /// Build a frame for `identity`; fails if `payload` is longer than a frame allows
    pub fn new(identity: SensorIdentity, timestamp: i64, payload: &[u8]) -> Result<Self> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(ChannelError::PayloadTooLong { len: payload.len() });
        }
        let mut frame = Self::empty(identity, timestamp);
        frame.payload[..payload.len()].copy_from_slice(payload);
        frame.payload_len = payload.len() as u32;
        Ok(frame)
    }

    fn empty(identity: SensorIdentity, timestamp: i64) -> Self {
        Self {
            sensor_type: identity.sensor_type.as_raw(),
            version: 0,
            timestamp,
            option: 0,
            mode: 0,
            payload: [0; MAX_PAYLOAD_LEN],
            payload_len: 0,
            device_id: identity.device_id,
            sensor_index: identity.sensor_index,
            locality: identity.locality.as_raw(),
        }
    }

    /// Convert a HAL event, truncating payloads that do not fit
    pub fn from_hal_event(event: &HalEvent) -> Self {
        let mut frame = Self::empty(event.identity, event.timestamp_ns);
        frame.version = event.version;
        frame.option = event.option;
        frame.mode = event.mode;

        let len = if event.data.len() > MAX_PAYLOAD_LEN {
            tracing::warn!(
                sensor = %event.identity,
                len = event.data.len(),
                "Event payload truncated to {} bytes",
                MAX_PAYLOAD_LEN
            );
            MAX_PAYLOAD_LEN
        } else {
            event.data.len()
        };
        frame.payload[..len].copy_from_slice(&event.data[..len]);
        frame.payload_len = len as u32;
        frame
    }

    pub fn identity(&self) -> SensorIdentity {
        SensorIdentity::new(
            self.device_id,
            SensorType(self.sensor_type),
            self.sensor_index,
            Locality::from_raw(self.locality),
        )
    }

    /// The meaningful part of the payload
    pub fn payload(&self) -> &[u8] {
        let len = (self.payload_len as usize).min(MAX_PAYLOAD_LEN);
        &self.payload[..len]
    }

    pub fn with_mode(mut self, mode: i32) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_option(mut self, option: u32) -> Self {
        self.option = option;
        self
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(FRAME_SIZE);
        buf.put_i32_ne(self.sensor_type);
        buf.put_i32_ne(self.version);
        buf.put_i64_ne(self.timestamp);
        buf.put_u32_ne(self.option);
        buf.put_i32_ne(self.mode);
        buf.put_slice(&self.payload);
        buf.put_u32_ne(self.payload_len);
        buf.put_i32_ne(self.device_id);
        buf.put_i32_ne(self.sensor_index);
        buf.put_i32_ne(self.locality);
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_SIZE);
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Decode one frame; rejects records whose payload length is out of range
    pub fn decode(raw: &[u8; FRAME_SIZE]) -> Result<Self> {
        let mut buf = &raw[..];
        let sensor_type = buf.get_i32_ne();
        let version = buf.get_i32_ne();
        let timestamp = buf.get_i64_ne();
        let option = buf.get_u32_ne();
        let mode = buf.get_i32_ne();
        let mut payload = [0u8; MAX_PAYLOAD_LEN];
        buf.copy_to_slice(&mut payload);
        let payload_len = buf.get_u32_ne();
        if payload_len as usize > MAX_PAYLOAD_LEN {
            return Err(ChannelError::CorruptFrame {
                payload_len,
                max: MAX_PAYLOAD_LEN,
            });
        }
        Ok(Self {
            sensor_type,
            version,
            timestamp,
            option,
            mode,
            payload,
            payload_len,
            device_id: buf.get_i32_ne(),
            sensor_index: buf.get_i32_ne(),
            locality: buf.get_i32_ne(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_identity() -> SensorIdentity {
        SensorIdentity::local(1, SensorType::ACCELEROMETER)
    }

    fn decode_bytes(bytes: &[u8]) -> Result<EventFrame> {
        let raw: &[u8; FRAME_SIZE] = bytes.try_into().expect("frame sized buffer");
        EventFrame::decode(raw)
    }

    #[test]
    fn test_frame_size_is_fixed() {
        assert_eq!(FRAME_SIZE, 104);
        let frame = EventFrame::new(sample_identity(), 1, &[1, 2, 3]).unwrap();
        assert_eq!(frame.encode().len(), FRAME_SIZE);
    }

    #[test]
    fn test_new_rejects_oversized_payload() {
        let err = EventFrame::new(sample_identity(), 0, &[0; 65]).unwrap_err();
        assert!(matches!(err, ChannelError::PayloadTooLong { len: 65 }));
    }

    #[test]
    fn test_from_hal_event_truncates() {
        let event = HalEvent::new(sample_identity(), 42, (0..100).collect());
        let frame = EventFrame::from_hal_event(&event);
        assert_eq!(frame.payload_len, 64);
        assert_eq!(frame.payload(), &(0..64).collect::<Vec<u8>>()[..]);
        assert_eq!(frame.identity(), sample_identity());
        assert_eq!(frame.timestamp, 42);
    }

    #[test]
    fn test_decode_rejects_corrupt_length() {
        let mut bytes = BytesMut::new();
        EventFrame::new(sample_identity(), 0, &[9; 8])
            .unwrap()
            .encode_into(&mut bytes);
        // payload_len sits after the 88 byte header and payload
        bytes[88..92].copy_from_slice(&65u32.to_ne_bytes());
        let err = decode_bytes(&bytes).unwrap_err();
        assert!(matches!(err, ChannelError::CorruptFrame { payload_len: 65, .. }));
    }

    proptest! {
        #[test]
        fn prop_frame_survives_encoding(
            sensor_type in any::<i32>(),
            timestamp in any::<i64>(),
            option in any::<u32>(),
            mode in 0i32..5,
            device_id in any::<i32>(),
            sensor_index in 0i32..8,
            payload in proptest::collection::vec(any::<u8>(), 0..=MAX_PAYLOAD_LEN),
        ) {
            let identity = SensorIdentity::new(device_id, SensorType(sensor_type), sensor_index, Locality::Local);
            let frame = EventFrame::new(identity, timestamp, &payload)
                .unwrap()
                .with_mode(mode)
                .with_option(option);
            let decoded = decode_bytes(&frame.encode()).unwrap();
            prop_assert_eq!(decoded, frame);
            prop_assert_eq!(decoded.payload(), &payload[..]);
        }
    }
}
