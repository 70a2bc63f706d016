use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use image::DynamicImage;
use tokio::sync::watch;

/// A decoded frame. Only the newest one is ever kept.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub image: Arc<DynamicImage>,
    pub byte_len: usize,
    pub received_at: DateTime<Utc>,
}

impl VideoFrame {
    pub fn dimensions(&self) -> (u32, u32) {
        (self.image.width(), self.image.height())
    }
}

pub fn decode_frame(bytes: &[u8], received_at: DateTime<Utc>) -> Result<VideoFrame> {
    let image = image::load_from_memory(bytes).context("frame is not a decodable image")?;
    Ok(VideoFrame {
        image: Arc::new(image),
        byte_len: bytes.len(),
        received_at,
    })
}

/// Single-slot holder for the latest frame.
#[derive(Clone)]
pub struct FrameSlot {
    tx: Arc<watch::Sender<Option<VideoFrame>>>,
}

impl Default for FrameSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSlot {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    pub fn publish(&self, frame: VideoFrame) {
        self.tx.send_replace(Some(frame));
    }

    pub fn latest(&self) -> Option<VideoFrame> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<VideoFrame>> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, RgbImage};
    use std::io::Cursor;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::new(width, height))
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn decodes_image_bytes() {
        let frame = decode_frame(&png(4, 3), Utc::now()).unwrap();
        assert_eq!(frame.dimensions(), (4, 3));
    }

    #[test]
    fn garbage_fails_to_decode() {
        assert!(decode_frame(b"\x00\x01not an image", Utc::now()).is_err());
    }

    #[test]
    fn slot_keeps_only_newest() {
        let slot = FrameSlot::new();
        assert!(slot.latest().is_none());

        slot.publish(decode_frame(&png(2, 2), Utc::now()).unwrap());
        slot.publish(decode_frame(&png(8, 6), Utc::now()).unwrap());

        assert_eq!(slot.latest().unwrap().dimensions(), (8, 6));
    }
}
