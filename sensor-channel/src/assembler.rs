//! Reassembly of frames from a byte stream
//!
//! Stream reads may end anywhere inside a frame. The assembler keeps the
//! leftover tail and yields complete frames once enough bytes arrive.
//! Records that fail to decode are skipped, and the stream stays aligned
//! because every record has the same size.

use bytes::{Buf, BytesMut};

use crate::frame::{EventFrame, FRAME_SIZE};

#[derive(Debug, Default)]
pub struct FrameAssembler {
    pending: BytesMut,
    corrupt: u64,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `bytes` and hand every complete frame to `on_frame`
    ///
    /// Returns the number of frames delivered.
    pub fn feed<F>(&mut self, bytes: &[u8], mut on_frame: F) -> usize
    where
        F: FnMut(EventFrame),
    {
        self.pending.extend_from_slice(bytes);
        let mut delivered = 0;
        while self.pending.len() >= FRAME_SIZE {
            let mut raw = [0u8; FRAME_SIZE];
            self.pending.copy_to_slice(&mut raw);
            match EventFrame::decode(&raw) {
                Ok(frame) => {
                    on_frame(frame);
                    delivered += 1;
                }
                Err(e) => {
                    self.corrupt += 1;
                    tracing::warn!("Discarding frame: {}", e);
                }
            }
        }
        delivered
    }

    /// Bytes of an incomplete frame still waiting for the rest
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Frames discarded because they did not decode
    pub fn corrupt_frames(&self) -> u64 {
        self.corrupt
    }
}
