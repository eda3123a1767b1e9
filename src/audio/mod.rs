//! Audio capture module using cpal for cross-platform microphone access
//!
//! Enumerates capture-class input devices once per session and records
//! push-to-talk audio on a dedicated thread at the device's native sample
//! rate in mono PCM format. Recorded samples are packaged as WAV for the
//! gateway, which treats the blob as opaque.

mod types;

pub use types::{AudioCaptureError, AudioCaptureHandle, AudioChunk, CaptureDevice};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleFormat;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Samples per chunk pushed to the collector
const CHUNK_SIZE: usize = 1024;

/// Rate written into the WAV header when the capture produced no chunks
const FALLBACK_SAMPLE_RATE: u32 = 16_000;

/// Seam between the controller and the platform capture implementation
pub trait CaptureBackend: Send + Sync {
    /// Begin capturing on the device at `device_index`; the receiver yields
    /// PCM chunks until the handle is stopped.
    fn start(
        &self,
        device_index: usize,
    ) -> Result<(AudioCaptureHandle, mpsc::Receiver<AudioChunk>), AudioCaptureError>;
}

/// cpal-backed capture used in production
pub struct CpalCapture;

impl CaptureBackend for CpalCapture {
    fn start(
        &self,
        device_index: usize,
    ) -> Result<(AudioCaptureHandle, mpsc::Receiver<AudioChunk>), AudioCaptureError> {
        start_capture(device_index)
    }
}

/// Enumerate audio-capture-class devices
///
/// Performed once per session; enumeration failure degrades to an empty list
/// and the capture path falls back to the host default device.
pub fn list_input_devices() -> Vec<CaptureDevice> {
    let host = cpal::default_host();
    match host.input_devices() {
        Ok(devices) => {
            let list: Vec<CaptureDevice> = devices
                .map(|device| CaptureDevice {
                    name: device.name().unwrap_or_else(|_| "Unknown".to_string()),
                })
                .collect();
            info!("Found {} audio input devices", list.len());
            list
        }
        Err(e) => {
            error!("Failed to enumerate audio input devices: {}", e);
            Vec::new()
        }
    }
}

/// Start audio capture on a dedicated thread
///
/// Captures from the device at `device_index`, falling back to the host
/// default when the index is not available. Capture errors inside the thread
/// are logged; the chunk channel then closes without delivering samples.
///
/// # Returns
/// A tuple containing:
/// - `AudioCaptureHandle` - Used to stop capture and check status
/// - `mpsc::Receiver<AudioChunk>` - Receives audio chunks for collection
pub fn start_capture(
    device_index: usize,
) -> Result<(AudioCaptureHandle, mpsc::Receiver<AudioChunk>), AudioCaptureError> {
    let is_capturing = Arc::new(AtomicBool::new(true));
    let is_capturing_clone = is_capturing.clone();

    let (chunk_tx, chunk_rx) = mpsc::channel(600);

    let thread_handle = thread::spawn(move || {
        if let Err(e) = run_capture(device_index, is_capturing_clone, chunk_tx) {
            error!("Audio capture error: {}", e);
        }
    });

    let handle = AudioCaptureHandle {
        is_capturing,
        thread_handle: Some(thread_handle),
    };

    Ok((handle, chunk_rx))
}

/// Run audio capture on the current thread (blocking)
fn run_capture(
    device_index: usize,
    is_capturing: Arc<AtomicBool>,
    chunk_tx: mpsc::Sender<AudioChunk>,
) -> Result<(), AudioCaptureError> {
    let host = cpal::default_host();

    let device = match host.input_devices() {
        Ok(mut devices) => devices.nth(device_index),
        Err(e) => {
            warn!("Failed to enumerate input devices: {}", e);
            None
        }
    }
    .or_else(|| host.default_input_device())
    .ok_or(AudioCaptureError::NoInputDevice)?;

    let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
    info!("Using audio input device: {}", device_name);

    let supported_config = device
        .default_input_config()
        .map_err(|e| AudioCaptureError::ConfigError(e.to_string()))?;
    let sample_format = supported_config.sample_format();
    let config: cpal::StreamConfig = supported_config.into();
    let sample_rate = config.sample_rate.0;
    let channels = config.channels as usize;

    info!("Audio config: {} channels, {} Hz", channels, sample_rate);

    let err_callback = |err| {
        error!("Audio stream error: {}", err);
    };

    let stream = match sample_format {
        SampleFormat::I16 => {
            let is_capturing_stream = is_capturing.clone();
            let chunk_tx_stream = chunk_tx.clone();
            let mut pending: Vec<i16> = Vec::with_capacity(CHUNK_SIZE * 2);
            device.build_input_stream(
                &config,
                move |data: &[i16], _| {
                    if !is_capturing_stream.load(Ordering::SeqCst) {
                        return;
                    }
                    push_samples(data, channels, sample_rate, &mut pending, &chunk_tx_stream);
                },
                err_callback,
                None,
            )?
        }
        SampleFormat::F32 => {
            let is_capturing_stream = is_capturing.clone();
            let chunk_tx_stream = chunk_tx.clone();
            let mut pending: Vec<i16> = Vec::with_capacity(CHUNK_SIZE * 2);
            device.build_input_stream(
                &config,
                move |data: &[f32], _| {
                    if !is_capturing_stream.load(Ordering::SeqCst) {
                        return;
                    }
                    let samples: Vec<i16> = data
                        .iter()
                        .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
                        .collect();
                    push_samples(
                        &samples,
                        channels,
                        sample_rate,
                        &mut pending,
                        &chunk_tx_stream,
                    );
                },
                err_callback,
                None,
            )?
        }
        sample_format => {
            return Err(AudioCaptureError::UnsupportedFormat(format!(
                "{:?}",
                sample_format
            )));
        }
    };

    stream.play()?;
    info!("Audio capture started");

    // Keep the stream alive until capture is stopped
    while is_capturing.load(Ordering::SeqCst) {
        thread::sleep(std::time::Duration::from_millis(100));
    }

    drop(stream);
    Ok(())
}

/// Convert to mono, buffer, and send complete chunks
fn push_samples(
    data: &[i16],
    channels: usize,
    sample_rate: u32,
    pending: &mut Vec<i16>,
    chunk_tx: &mpsc::Sender<AudioChunk>,
) {
    if channels > 1 {
        pending.extend(data.chunks(channels).map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / channels as i32) as i16
        }));
    } else {
        pending.extend_from_slice(data);
    }

    while pending.len() >= CHUNK_SIZE {
        let chunk: Vec<i16> = pending.drain(..CHUNK_SIZE).collect();
        let audio_chunk = AudioChunk {
            samples: chunk,
            sample_rate,
        };
        // Use try_send to avoid blocking the audio callback
        if let Err(e) = chunk_tx.try_send(audio_chunk) {
            warn!("Audio buffer overflow - chunk dropped: {}", e);
            return;
        }
    }
}

/// Package captured samples as a mono 16-bit WAV blob
pub fn encode_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>, AudioCaptureError> {
    let rate = if sample_rate == 0 {
        FALLBACK_SAMPLE_RATE
    } else {
        sample_rate
    };
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
    for &sample in samples {
        writer.write_sample(sample)?;
    }
    writer.finalize()?;

    Ok(cursor.into_inner())
}
