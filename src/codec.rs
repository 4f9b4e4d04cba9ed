//! Frame encoding and overlay normalization.
//!
//! Outbound stills are downscaled and JPEG-compressed to bound payload
//! size and latency; the backend does its own processing so fidelity is
//! not a goal. Inbound annotated frames arrive in several shapes and are
//! normalized into one displayable data URI.

use crate::capture::{CaptureConfig, Frame};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use thiserror::Error;

/// MIME type of annotated frames returned by the backend.
pub const OVERLAY_MIME: &str = "image/jpeg";

/// Smallest decoded overlay accepted for display. Anything shorter is a
/// truncated or corrupt payload.
pub const DEFAULT_MIN_OVERLAY_BYTES: usize = 100;

/// Errors that can occur while encoding or decoding a single frame.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("jpeg encoding failed: {0}")]
    Encode(#[from] image::ImageError),
    #[error("encoder worker failed: {0}")]
    Worker(String),
    #[error("overlay payload is not valid base64: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
    #[error("overlay payload too small: {len} bytes (minimum {min})")]
    Undersized { len: usize, min: usize },
    #[error("overlay envelope carries no frame")]
    EmptyEnvelope,
    #[error("malformed data uri")]
    MalformedDataUri,
}

/// A still encoded into its wire form.
#[derive(Clone)]
pub struct EncodedFrame {
    bytes: Vec<u8>,
    width: u32,
    height: u32,
    sequence: u64,
}

impl EncodedFrame {
    /// Encoded JPEG bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Encoded dimensions (after downscaling).
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Device sequence number of the source still.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl std::fmt::Debug for EncodedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncodedFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sequence", &self.sequence)
            .field("bytes", &self.bytes.len())
            .finish()
    }
}

/// Annotated-frame payload as delivered by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnnotatedPayload {
    /// Raw image bytes.
    Bytes(Vec<u8>),
    /// Bare base64 or a `data:` URI.
    Text(String),
    /// Object carrying a `frame` field with base64 content.
    Envelope { frame: Option<String> },
}

/// A normalized overlay ready for the view layer.
#[derive(Clone, PartialEq, Eq)]
pub struct OverlayImage {
    data_uri: String,
    byte_len: usize,
}

impl OverlayImage {
    fn from_base64(mime: &str, payload: &str, byte_len: usize) -> Self {
        Self {
            data_uri: format!("data:{mime};base64,{payload}"),
            byte_len,
        }
    }

    /// `data:<mime>;base64,<payload>` form, directly renderable.
    pub fn data_uri(&self) -> &str {
        &self.data_uri
    }

    /// The base64 payload without the URI prefix.
    pub fn payload(&self) -> &str {
        self.data_uri
            .split_once(',')
            .map(|(_, payload)| payload)
            .unwrap_or_default()
    }

    /// Decoded image size in bytes.
    pub fn byte_len(&self) -> usize {
        self.byte_len
    }
}

impl std::fmt::Debug for OverlayImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayImage")
            .field("byte_len", &self.byte_len)
            .finish()
    }
}

/// Converts camera stills to wire bytes and inbound payloads to overlays.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    scale: f32,
    jpeg_quality: u8,
    min_overlay_bytes: usize,
}

impl FrameCodec {
    pub fn new(capture: &CaptureConfig, min_overlay_bytes: usize) -> Self {
        Self {
            scale: capture.scale,
            jpeg_quality: capture.jpeg_quality.clamp(1, 100),
            min_overlay_bytes,
        }
    }

    fn target_dimensions(&self, width: u32, height: u32) -> (u32, u32) {
        let scaled = |v: u32| ((v as f32 * self.scale).round() as u32).max(1);
        (scaled(width), scaled(height))
    }

    /// Downscales and JPEG-compresses a still.
    pub fn encode(&self, frame: Frame) -> Result<EncodedFrame, CodecError> {
        let ((width, height), sequence) = (frame.dimensions(), frame.sequence());
        let image = frame.into_image();

        let (target_w, target_h) = self.target_dimensions(width, height);
        let image = if (target_w, target_h) != (width, height) {
            imageops::resize(&image, target_w, target_h, FilterType::Triangle)
        } else {
            image
        };

        let mut bytes = Vec::new();
        JpegEncoder::new_with_quality(&mut bytes, self.jpeg_quality).encode_image(&image)?;

        tracing::trace!(
            sequence,
            width = target_w,
            height = target_h,
            bytes = bytes.len(),
            "Encoded frame"
        );

        Ok(EncodedFrame {
            bytes,
            width: target_w,
            height: target_h,
            sequence,
        })
    }

    /// Runs [`encode`](Self::encode) on the blocking pool.
    pub async fn encode_async(&self, frame: Frame) -> Result<EncodedFrame, CodecError> {
        let codec = self.clone();
        tokio::task::spawn_blocking(move || codec.encode(frame))
            .await
            .map_err(|e| CodecError::Worker(e.to_string()))?
    }

    /// Normalizes an annotated-frame payload into a displayable overlay.
    pub fn decode_overlay(&self, payload: &AnnotatedPayload) -> Result<OverlayImage, CodecError> {
        match payload {
            AnnotatedPayload::Bytes(bytes) => {
                self.check_len(bytes.len())?;
                Ok(OverlayImage::from_base64(
                    OVERLAY_MIME,
                    &STANDARD.encode(bytes),
                    bytes.len(),
                ))
            }
            AnnotatedPayload::Text(text) => self.decode_text(text),
            AnnotatedPayload::Envelope { frame: Some(text) } => self.decode_text(text),
            AnnotatedPayload::Envelope { frame: None } => Err(CodecError::EmptyEnvelope),
        }
    }

    fn decode_text(&self, text: &str) -> Result<OverlayImage, CodecError> {
        let text = text.trim();
        let (mime, payload) = match text.strip_prefix("data:") {
            Some(rest) => {
                let (meta, payload) = rest.split_once(',').ok_or(CodecError::MalformedDataUri)?;
                let mime = meta
                    .strip_suffix(";base64")
                    .ok_or(CodecError::MalformedDataUri)?;
                (if mime.is_empty() { OVERLAY_MIME } else { mime }, payload)
            }
            None => (OVERLAY_MIME, text),
        };

        let decoded_len = STANDARD.decode(payload)?.len();
        self.check_len(decoded_len)?;
        Ok(OverlayImage::from_base64(mime, payload, decoded_len))
    }

    fn check_len(&self, len: usize) -> Result<(), CodecError> {
        if len < self.min_overlay_bytes {
            return Err(CodecError::Undersized {
                len,
                min: self.min_overlay_bytes,
            });
        }
        Ok(())
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(&CaptureConfig::default(), DEFAULT_MIN_OVERLAY_BYTES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{Camera, MockCamera};
    use proptest::prelude::*;

    async fn capture_still(width: u32, height: u32) -> Frame {
        let mut camera = MockCamera::new();
        camera
            .open(&CaptureConfig::with_dimensions(width, height))
            .unwrap();
        camera.capture().await.unwrap()
    }

    #[tokio::test]
    async fn test_encode_downscales_to_jpeg() {
        let codec = FrameCodec::default();
        let frame = capture_still(64, 48).await;

        let encoded = codec.encode(frame).unwrap();
        assert_eq!(encoded.dimensions(), (32, 24));
        assert_eq!(encoded.sequence(), 1);
        // JPEG SOI marker
        assert_eq!(&encoded.bytes()[..2], &[0xFF, 0xD8]);
    }

    #[tokio::test]
    async fn test_encode_async_matches_sync() {
        let codec = FrameCodec::default();
        let encoded = codec.encode_async(capture_still(32, 32).await).await.unwrap();
        assert_eq!(encoded.dimensions(), (16, 16));
    }

    #[test]
    fn test_encode_full_scale_keeps_dimensions() {
        let codec = FrameCodec::new(
            &CaptureConfig {
                scale: 1.0,
                ..Default::default()
            },
            DEFAULT_MIN_OVERLAY_BYTES,
        );
        let frame = Frame::from_rgb(vec![128u8; 20 * 10 * 3], 20, 10, 4).unwrap();
        let encoded = codec.encode(frame).unwrap();
        assert_eq!(encoded.dimensions(), (20, 10));
        assert_eq!(encoded.sequence(), 4);
    }

    #[test]
    fn test_bare_base64_gets_prefixed() {
        let codec = FrameCodec::default();
        let payload = STANDARD.encode(vec![7u8; 300]);

        let overlay = codec
            .decode_overlay(&AnnotatedPayload::Text(payload.clone()))
            .unwrap();
        assert_eq!(overlay.data_uri(), format!("data:image/jpeg;base64,{payload}"));
        assert_eq!(overlay.byte_len(), 300);
        assert_eq!(overlay.payload(), payload);
    }

    #[test]
    fn test_data_uri_kept_verbatim() {
        let codec = FrameCodec::default();
        let uri = format!("data:image/png;base64,{}", STANDARD.encode(vec![1u8; 200]));

        let overlay = codec.decode_overlay(&AnnotatedPayload::Text(uri.clone())).unwrap();
        assert_eq!(overlay.data_uri(), uri);
    }

    #[test]
    fn test_undersized_payload_rejected() {
        let codec = FrameCodec::default();
        let tiny = STANDARD.encode(b"0123456789");

        assert!(matches!(
            codec.decode_overlay(&AnnotatedPayload::Text(tiny)),
            Err(CodecError::Undersized { len: 10, .. })
        ));
        assert!(matches!(
            codec.decode_overlay(&AnnotatedPayload::Bytes(vec![0u8; 10])),
            Err(CodecError::Undersized { .. })
        ));
    }

    #[test]
    fn test_corrupt_payloads_rejected() {
        let codec = FrameCodec::default();

        assert!(matches!(
            codec.decode_overlay(&AnnotatedPayload::Text("not base64 at all!".repeat(20))),
            Err(CodecError::InvalidBase64(_))
        ));
        assert!(matches!(
            codec.decode_overlay(&AnnotatedPayload::Text("data:image/jpeg,abc".into())),
            Err(CodecError::MalformedDataUri)
        ));
        assert!(matches!(
            codec.decode_overlay(&AnnotatedPayload::Envelope { frame: None }),
            Err(CodecError::EmptyEnvelope)
        ));
    }

    proptest! {
        #[test]
        fn prop_all_representations_converge(bytes in proptest::collection::vec(any::<u8>(), 100..2048)) {
            let codec = FrameCodec::default();
            let b64 = STANDARD.encode(&bytes);

            let from_bytes = codec.decode_overlay(&AnnotatedPayload::Bytes(bytes.clone())).unwrap();
            let from_text = codec.decode_overlay(&AnnotatedPayload::Text(b64.clone())).unwrap();
            let from_uri = codec
                .decode_overlay(&AnnotatedPayload::Text(format!("data:image/jpeg;base64,{b64}")))
                .unwrap();
            let from_envelope = codec
                .decode_overlay(&AnnotatedPayload::Envelope { frame: Some(b64) })
                .unwrap();

            prop_assert_eq!(&from_bytes, &from_text);
            prop_assert_eq!(&from_bytes, &from_uri);
            prop_assert_eq!(&from_bytes, &from_envelope);
            prop_assert_eq!(from_bytes.byte_len(), bytes.len());
        }
    }
}
