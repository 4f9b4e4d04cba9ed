//! Benchmarks for frame encoding and overlay decoding.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

use dose_verify::capture::{CaptureConfig, Frame, BYTES_PER_PIXEL};
use dose_verify::codec::{AnnotatedPayload, FrameCodec, DEFAULT_MIN_OVERLAY_BYTES};

fn create_test_frame(width: u32, height: u32) -> Frame {
    let pixels: Vec<u8> = (0..width as usize * height as usize * BYTES_PER_PIXEL)
        .map(|i| (i % 251) as u8)
        .collect();
    Frame::from_rgb(pixels, width, height, 1).expect("buffer matches dimensions")
}

fn benchmark_encode(c: &mut Criterion) {
    let vga = create_test_frame(640, 480);
    let hd = create_test_frame(1280, 720);

    let half = FrameCodec::new(&CaptureConfig::default(), DEFAULT_MIN_OVERLAY_BYTES);
    let full = FrameCodec::new(
        &CaptureConfig {
            scale: 1.0,
            ..Default::default()
        },
        DEFAULT_MIN_OVERLAY_BYTES,
    );

    c.bench_function("encode_vga_half_scale", |b| {
        b.iter(|| half.encode(black_box(vga.clone())))
    });

    c.bench_function("encode_vga_full_scale", |b| {
        b.iter(|| full.encode(black_box(vga.clone())))
    });

    c.bench_function("encode_720p_half_scale", |b| {
        b.iter(|| half.encode(black_box(hd.clone())))
    });
}

fn benchmark_decode_overlay(c: &mut Criterion) {
    let codec = FrameCodec::default();
    let bytes = vec![0xAB; 37_500];
    let text = AnnotatedPayload::Text(STANDARD.encode(&bytes));
    let raw = AnnotatedPayload::Bytes(bytes);

    c.bench_function("decode_overlay_base64_50k", |b| {
        b.iter(|| codec.decode_overlay(black_box(&text)))
    });

    c.bench_function("decode_overlay_bytes_37k", |b| {
        b.iter(|| codec.decode_overlay(black_box(&raw)))
    });
}

criterion_group!(benches, benchmark_encode, benchmark_decode_overlay);
criterion_main!(benches);
