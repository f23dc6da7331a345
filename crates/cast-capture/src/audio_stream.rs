//! Loopback audio capture via cpal.
//!
//! Mirrors system playback by opening the default output device in input
//! mode where the host supports loopback (WASAPI), falling back to the
//! default input device elsewhere. Runs on a dedicated OS thread that owns
//! the cpal stream, forwarding [`AudioChunk`]s to a tokio mpsc channel in
//! whatever format the device negotiated; resampling happens downstream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};
use tokio::sync::mpsc;

use crate::frame::AudioChunk;

/// How long `start` waits for the capture thread to negotiate a device.
const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(5);

/// The format the device actually negotiated.
#[derive(Debug, Clone)]
pub struct AudioFormat {
    pub channels: u16,
    pub sample_rate: u32,
    pub device_name: String,
}

/// Handle to a running loopback capture stream.
///
/// Dropping this stops the audio capture thread.
pub struct AudioCaptureStream {
    running: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl std::fmt::Debug for AudioCaptureStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioCaptureStream")
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl AudioCaptureStream {
    /// Start capturing loopback audio.
    ///
    /// # Errors
    ///
    /// Returns [`AudioCaptureError`] when no usable device exists or the
    /// stream cannot be opened; the server disables the audio stage for
    /// the process in that case.
    pub fn start(
        channel_capacity: usize,
    ) -> Result<(Self, mpsc::Receiver<AudioChunk>, AudioFormat), AudioCaptureError> {
        let (tx, rx) = mpsc::channel(channel_capacity);
        let (format_tx, format_rx) = std::sync::mpsc::channel();
        let running = Arc::new(AtomicBool::new(true));
        let running_clone = Arc::clone(&running);

        let thread = std::thread::Builder::new()
            .name("cast-audio".into())
            .spawn(move || run_capture_thread(tx, &format_tx, &running_clone))
            .map_err(AudioCaptureError::SpawnThread)?;

        let format = match format_rx.recv_timeout(NEGOTIATION_TIMEOUT) {
            Ok(Ok(format)) => format,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                running.store(false, Ordering::SeqCst);
                let _ = thread.join();
                return Err(AudioCaptureError::Init(
                    "audio device negotiation timed out".into(),
                ));
            }
        };

        Ok((
            Self {
                running,
                thread: Some(thread),
            },
            rx,
            format,
        ))
    }

    /// Stop the capture and join the thread.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for AudioCaptureStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Pick a loopback-capable device and keep its stream alive until stopped.
fn run_capture_thread(
    tx: mpsc::Sender<AudioChunk>,
    format_tx: &std::sync::mpsc::Sender<Result<AudioFormat, AudioCaptureError>>,
    running: &AtomicBool,
) {
    let (device, supported, loopback) = match select_device() {
        Ok(selection) => selection,
        Err(e) => {
            let _ = format_tx.send(Err(e));
            return;
        }
    };

    let device_name = device.name().unwrap_or_else(|_| "unknown".into());
    let sample_format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();
    let format = AudioFormat {
        channels: config.channels,
        sample_rate: config.sample_rate.0,
        device_name: device_name.clone(),
    };

    let stream = match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(&device, &config, tx),
        cpal::SampleFormat::I16 => build_stream::<i16>(&device, &config, tx),
        cpal::SampleFormat::U16 => build_stream::<u16>(&device, &config, tx),
        other => Err(AudioCaptureError::Init(format!(
            "unsupported sample format {other:?}"
        ))),
    };

    let stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            let _ = format_tx.send(Err(e));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = format_tx.send(Err(AudioCaptureError::Init(format!(
            "failed to start stream: {e}"
        ))));
        return;
    }

    tracing::info!(
        device = %device_name,
        channels = format.channels,
        sample_rate = format.sample_rate,
        loopback,
        "Audio capture stream connected"
    );
    let _ = format_tx.send(Ok(format));

    // The cpal stream delivers data on its own callback thread; this one
    // just keeps the stream alive until stopped.
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(50));
    }

    drop(stream);
    tracing::info!("Audio capture thread exiting");
}

/// Prefer the default output device (loopback mirror of system playback),
/// then the default input device.
fn select_device(
) -> Result<(cpal::Device, cpal::SupportedStreamConfig, bool), AudioCaptureError> {
    let host = cpal::default_host();

    if let Some(device) = host.default_output_device() {
        // Hosts with loopback support expose input configs on output
        // devices; elsewhere this fails and we fall through.
        if let Ok(supported) = device.default_input_config() {
            return Ok((device, supported, true));
        }
    }

    let device = host
        .default_input_device()
        .ok_or_else(|| AudioCaptureError::Init("no audio device available".into()))?;
    let supported = device
        .default_input_config()
        .map_err(|e| AudioCaptureError::Init(format!("no input config: {e}")))?;
    Ok((device, supported, false))
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    tx: mpsc::Sender<AudioChunk>,
) -> Result<cpal::Stream, AudioCaptureError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels;
    let sample_rate = config.sample_rate.0;
    let mut sequence = 0u64;

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let samples: Vec<f32> = data.iter().map(|s| f32::from_sample(*s)).collect();
                let chunk = AudioChunk {
                    samples,
                    channels,
                    sample_rate,
                    sequence,
                };
                sequence += 1;
                if tx.try_send(chunk).is_err() {
                    tracing::trace!(sequence, "audio channel full, dropping chunk");
                }
            },
            |err| tracing::error!("audio stream error: {err}"),
            None,
        )
        .map_err(|e| AudioCaptureError::Init(format!("failed to build stream: {e}")))
}

#[derive(Debug, thiserror::Error)]
pub enum AudioCaptureError {
    /// The backend could not be initialized; audio is disabled for the
    /// process.
    #[error("failed to initialize audio capture: {0}")]
    Init(String),

    #[error("failed to spawn audio capture thread")]
    SpawnThread(#[source] std::io::Error),
}
