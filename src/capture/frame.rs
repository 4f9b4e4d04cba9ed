//! Frame type representing a captured still with metadata.

use image::RgbImage;
use std::time::Instant;
use thiserror::Error;

/// Bytes per pixel of the RGB8 buffers produced by every camera.
pub const BYTES_PER_PIXEL: usize = 3;

/// A raw buffer that does not describe a complete RGB8 image.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{len} bytes do not form a {width}x{height} RGB8 image")]
pub struct FrameSizeError {
    pub width: u32,
    pub height: u32,
    pub len: usize,
}

/// A single still captured from the camera.
///
/// The image is always complete: a frame can only be built from a buffer
/// whose length matches its dimensions, so the codec never sees a torn
/// read.
#[derive(Clone)]
pub struct Frame {
    /// Packed RGB8 image, row-major.
    image: RgbImage,
    /// When the device delivered the still.
    captured_at: Instant,
    /// Per-device capture counter, starting at 1 after open.
    sequence: u64,
}

impl Frame {
    /// Wraps a packed RGB8 buffer.
    ///
    /// Fails when either dimension is zero or `pixels` is not exactly
    /// `width * height * 3` bytes long.
    pub fn from_rgb(
        pixels: Vec<u8>,
        width: u32,
        height: u32,
        sequence: u64,
    ) -> Result<Self, FrameSizeError> {
        let len = pixels.len();
        let expected = width as usize * height as usize * BYTES_PER_PIXEL;
        if width == 0 || height == 0 || len != expected {
            return Err(FrameSizeError { width, height, len });
        }
        let image =
            RgbImage::from_raw(width, height, pixels).ok_or(FrameSizeError { width, height, len })?;
        Ok(Self::from_image(image, sequence))
    }

    /// Wraps an already decoded image.
    pub fn from_image(image: RgbImage, sequence: u64) -> Self {
        Self {
            image,
            captured_at: Instant::now(),
            sequence,
        }
    }

    /// Borrows the image.
    #[inline]
    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    /// Consumes the frame, handing the image to the encoder without a copy.
    pub fn into_image(self) -> RgbImage {
        self.image
    }

    /// Returns `(width, height)` in pixels.
    #[inline]
    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    /// Returns the capture instant.
    #[inline]
    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    /// Returns the device sequence number.
    #[inline]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Returns the `[r, g, b]` value at `(x, y)`, or `None` outside the image.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        let (width, height) = self.dimensions();
        (x < width && y < height).then(|| self.image.get_pixel(x, y).0)
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (width, height) = self.dimensions();
        f.debug_struct("Frame")
            .field("width", &width)
            .field("height", &height)
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_rgb_keeps_layout() {
        let mut pixels = vec![0u8; 4 * 2 * BYTES_PER_PIXEL];
        // (x=1, y=1) starts at (1 * 4 + 1) * 3
        pixels[15..18].copy_from_slice(&[10, 20, 30]);

        let frame = Frame::from_rgb(pixels, 4, 2, 7).unwrap();
        assert_eq!(frame.dimensions(), (4, 2));
        assert_eq!(frame.sequence(), 7);
        assert_eq!(frame.pixel(1, 1), Some([10, 20, 30]));
        assert_eq!(frame.pixel(0, 0), Some([0, 0, 0]));
        assert_eq!(frame.pixel(4, 0), None);
    }

    #[test]
    fn test_from_rgb_rejects_short_buffer() {
        let err = Frame::from_rgb(vec![0u8; 10], 64, 48, 1).unwrap_err();
        assert_eq!(
            err,
            FrameSizeError {
                width: 64,
                height: 48,
                len: 10
            }
        );
    }

    #[test]
    fn test_from_rgb_rejects_empty_dimensions() {
        assert!(Frame::from_rgb(Vec::new(), 0, 48, 1).is_err());
        assert!(Frame::from_rgb(Vec::new(), 64, 0, 1).is_err());
    }

    #[test]
    fn test_into_image_returns_same_pixels() {
        let pixels: Vec<u8> = (0..6 * 3 * BYTES_PER_PIXEL).map(|i| i as u8).collect();
        let frame = Frame::from_rgb(pixels.clone(), 6, 3, 1).unwrap();
        assert_eq!(frame.into_image().into_raw(), pixels);
    }
}
