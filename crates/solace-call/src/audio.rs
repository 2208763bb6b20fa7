//! Microphone capture using CPAL
//!
//! The controller only sees [`AudioCaptureSource`]: `start()` hands back a stream
//! of [`AudioFrame`]s, `stop()` releases the device. [`CpalCapture`] is the bare
//! metal implementation; the cpal `Stream` is `!Send`, so it lives on a dedicated
//! thread for its whole life.

use crate::config::CaptureConfig;
use crate::error::CaptureError;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::mpsc as std_mpsc;
use std::thread;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

/// Stream of captured frames. Ends when capture stops.
pub type FrameStream = BoxStream<'static, AudioFrame>;

/// One chunk of microphone audio
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Audio samples (f32, normalized to -1.0 to 1.0)
    pub samples: Vec<f32>,

    /// Amplitude in [0, 1] derived from `samples`
    pub level: f32,

    /// Timestamp when captured
    pub timestamp: std::time::Instant,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, gain: f32) -> Self {
        let level = compute_level(&samples, gain);
        Self {
            samples,
            level,
            timestamp: std::time::Instant::now(),
        }
    }
}

/// Mean absolute sample value scaled by `gain`, clamped to [0, 1].
pub fn compute_level(samples: &[f32], gain: f32) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s.abs()).sum();
    let mean = sum / samples.len() as f32;
    (mean * gain).clamp(0.0, 1.0)
}

/// Owner of the microphone.
///
/// `stop()` must be idempotent, callable without a prior `start()`, and must
/// release the device before returning.
///
/// Both calls are synchronous and may block briefly while the device is opened
/// or released; the controller calls them inline from its actor task. Do not
/// wrap them in `block_in_place`, which panics on a current-thread runtime.
pub trait AudioCaptureSource: Send {
    fn start(&mut self) -> Result<FrameStream, CaptureError>;

    fn stop(&mut self);

    fn is_capturing(&self) -> bool;
}

/// Platform microphone permission prompt
pub trait MicrophonePermission: Send + Sync {
    fn request(&self) -> bool;
}

/// Grants permission iff the host exposes a default input device.
#[derive(Debug, Default)]
pub struct DevicePermission;

impl MicrophonePermission for DevicePermission {
    fn request(&self) -> bool {
        cpal::default_host().default_input_device().is_some()
    }
}

struct CaptureWorker {
    stop_tx: std_mpsc::Sender<()>,
    thread: thread::JoinHandle<()>,
}

/// Audio capture system using CPAL
pub struct CpalCapture {
    config: CaptureConfig,
    worker: Option<CaptureWorker>,
}

impl CpalCapture {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            worker: None,
        }
    }

    /// List available input devices
    pub fn list_input_devices() -> Result<Vec<String>, CaptureError> {
        let host = cpal::default_host();
        let devices = host.input_devices()?;

        let mut device_names = Vec::new();
        for device in devices {
            if let Ok(name) = device.name() {
                device_names.push(name);
            }
        }

        Ok(device_names)
    }
}

impl AudioCaptureSource for CpalCapture {
    fn start(&mut self) -> Result<FrameStream, CaptureError> {
        // Re-entry replaces the previous stream
        self.stop();

        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), CaptureError>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let config = self.config.clone();

        let thread = thread::Builder::new()
            .name("solace-capture".to_string())
            .spawn(move || {
                let stream = match build_input_stream(&config, frame_tx) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // Park until stop() (or the owner vanished), then drop the stream here.
                let _ = stop_rx.recv();
                drop(stream);
                debug!("capture stream released");
            })
            .map_err(|e| CaptureError::Configure(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(CaptureError::Configure("capture thread exited during setup".to_string()));
            }
        }

        self.worker = Some(CaptureWorker { stop_tx, thread });
        info!(sample_rate = self.config.sample_rate, "🎤 Audio capture started");
        Ok(UnboundedReceiverStream::new(frame_rx).boxed())
    }

    /// Joins the capture thread, so the stream is dropped before this returns.
    fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.stop_tx.send(());
            if worker.thread.join().is_err() {
                warn!("capture thread panicked during shutdown");
            }
            info!("⏹️ Audio capture stopped");
        }
    }

    fn is_capturing(&self) -> bool {
        self.worker.is_some()
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn build_input_stream(
    config: &CaptureConfig,
    frame_tx: mpsc::UnboundedSender<AudioFrame>,
) -> Result<cpal::Stream, CaptureError> {
    let device = cpal::default_host()
        .default_input_device()
        .ok_or(CaptureError::NoDevice)?;

    debug!(
        device = %device.name().unwrap_or_else(|_| "Unknown".to_string()),
        "using input device"
    );

    // Fails early when the session is unavailable (permission, route conflict)
    let _ = device.default_input_config()?;

    let stream_config = StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(config.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let chunk_size = config.chunk_size;
    let gain = config.level_gain;
    let mut sample_buffer = Vec::with_capacity(chunk_size);

    let stream = device.build_input_stream(
        &stream_config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            for &sample in data {
                sample_buffer.push(sample);

                if sample_buffer.len() >= chunk_size {
                    let samples = std::mem::replace(&mut sample_buffer, Vec::with_capacity(chunk_size));
                    // Receiver dropped means the controller moved on; frames are discarded.
                    let _ = frame_tx.send(AudioFrame::new(samples, gain));
                }
            }
        },
        move |err| {
            warn!(error = %err, "audio stream error");
        },
        None,
    )?;

    stream.play()?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_is_scaled_mean_absolute_value() {
        let samples = vec![0.1, -0.1, 0.1, -0.1];
        let level = compute_level(&samples, 5.0);
        assert!((level - 0.5).abs() < 1e-6);
    }

    #[test]
    fn level_is_clamped() {
        assert_eq!(compute_level(&[0.9, -0.9], 5.0), 1.0);
        assert_eq!(compute_level(&[], 5.0), 0.0);
        assert_eq!(compute_level(&[0.0; 480], 5.0), 0.0);
    }

    #[test]
    fn frame_carries_level() {
        let frame = AudioFrame::new(vec![0.02; 480], 5.0);
        assert!((frame.level - 0.1).abs() < 1e-6);
    }

    #[test]
    fn stop_without_start_is_noop() {
        let mut capture = CpalCapture::new(CaptureConfig::default());
        capture.stop();
        capture.stop();
        assert!(!capture.is_capturing());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn stop_runs_inline_on_current_thread_runtime() {
        let mut capture = CpalCapture::new(CaptureConfig::default());
        capture.stop();
        assert!(!capture.is_capturing());
    }

    #[test]
    #[ignore] // Requires audio hardware
    fn start_and_stop_real_device() {
        let mut capture = CpalCapture::new(CaptureConfig::default());
        if capture.start().is_ok() {
            assert!(capture.is_capturing());
            capture.stop();
            assert!(!capture.is_capturing());
        }
    }
}
