//! Re-chunking of an arbitrary byte stream into fixed-size frames.
//!
//! Request bodies arrive in chunks whose sizes depend on the transport. The
//! attachment host wants parts of exactly the configured size, so
//! [`FrameSlicer`] buffers one frame at a time and emits it as soon as it is
//! full. Whatever is left when the stream ends is emitted by
//! [`FrameSlicer::finish`] as a short final frame.

use bytes::{Bytes, BytesMut};
use std::num::NonZeroUsize;

/// Splits or merges input chunks into frames of a fixed size
#[derive(Debug)]
pub struct FrameSlicer {
    frame_size: NonZeroUsize,
    buffer: BytesMut,
}

impl FrameSlicer {
    /// Create a slicer emitting frames of `frame_size` bytes
    pub fn new(frame_size: NonZeroUsize) -> Self {
        Self {
            frame_size,
            buffer: BytesMut::with_capacity(frame_size.get()),
        }
    }

    /// Frame size in bytes
    pub fn frame_size(&self) -> usize {
        self.frame_size.get()
    }

    /// Bytes held back waiting for the current frame to fill
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Feed one input chunk, returning every frame it completed.
    ///
    /// A chunk larger than the frame size completes several frames in one
    /// call. An empty chunk is a no-op.
    pub fn push(&mut self, mut chunk: &[u8]) -> Vec<Bytes> {
        let mut frames = Vec::new();

        while !chunk.is_empty() {
            let space_left = self.frame_size.get() - self.buffer.len();
            let take = space_left.min(chunk.len());
            self.buffer.extend_from_slice(&chunk[..take]);
            chunk = &chunk[take..];

            if self.buffer.len() == self.frame_size.get() {
                frames.push(self.take_frame());
            }
        }

        frames
    }

    /// End of stream: emit the remaining bytes as a short frame, if any
    pub fn finish(mut self) -> Option<Bytes> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(self.take_frame())
        }
    }

    fn take_frame(&mut self) -> Bytes {
        let frame = self.buffer.split().freeze();
        self.buffer.reserve(self.frame_size.get());
        frame
    }
}
