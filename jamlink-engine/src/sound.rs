//! Audio-device collaborator contract.
//!
//! The platform binding calls back with between 32 and 512 frames of
//! 32-bit float stereo at 48 kHz; the engine adapts its ring water
//! targets to whatever block size arrives. Bindings are external - this
//! module only fixes the boundary and ships a clocked dummy backend for
//! headless operation and tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;

use jamlink_proto::SAMPLE_RATE;

use crate::client::MAX_BUFFER_SAMPLES;
use crate::runtime::Runtime;

/// Smallest audio-device callback size the engine accepts.
pub const MIN_BUFFER_SAMPLES: usize = 32;

#[derive(Debug, Error)]
pub enum SoundInitError {
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("unsupported device configuration: {0}")]
    UnsupportedConfig(String),
}

/// A platform audio binding. `start` opens the device and begins
/// calling [`crate::Client::sound_process`] from its callback thread.
pub trait SoundBackend {
    fn start(&mut self, rt: Arc<Runtime>, buffer_samples: usize) -> Result<(), SoundInitError>;
    fn stop(&mut self);
}

/// Thread-clocked backend with silent input and discarded output.
/// Keeps a client session alive without any audio hardware.
#[derive(Default)]
pub struct DummySoundBackend {
    running: Option<Arc<AtomicBool>>,
    handle: Option<JoinHandle<()>>,
}

impl DummySoundBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SoundBackend for DummySoundBackend {
    fn start(&mut self, rt: Arc<Runtime>, buffer_samples: usize) -> Result<(), SoundInitError> {
        if !(MIN_BUFFER_SAMPLES..=MAX_BUFFER_SAMPLES).contains(&buffer_samples) {
            return Err(SoundInitError::UnsupportedConfig(format!(
                "buffer of {} samples",
                buffer_samples
            )));
        }
        if self.running.is_some() {
            return Err(SoundInitError::DeviceUnavailable(
                "already started".to_string(),
            ));
        }

        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let period =
            Duration::from_nanos((buffer_samples as u64 * 1_000_000_000) / SAMPLE_RATE as u64);

        let handle = thread::Builder::new()
            .name("jamlink-dummy-sound".to_string())
            .spawn(move || {
                let mut left = vec![0.0f32; buffer_samples];
                let mut right = vec![0.0f32; buffer_samples];
                let mut next = Instant::now();

                while flag.load(Ordering::SeqCst) {
                    next += period;
                    let now = Instant::now();
                    if next > now {
                        thread::sleep(next - now);
                    } else {
                        // fell behind: re-anchor instead of bursting
                        next = now;
                    }

                    left.fill(0.0);
                    right.fill(0.0);
                    if let Some(client) = rt.client() {
                        client.sound_process(&mut left, &mut right);
                    }
                }
            })
            .map_err(|e| SoundInitError::DeviceUnavailable(e.to_string()))?;

        self.running = Some(running);
        self.handle = Some(handle);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            running.store(false, Ordering::SeqCst);
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::event_channel;
    use crate::runtime::Config;

    #[test]
    fn rejects_out_of_range_buffers() {
        let (tx, _rx) = event_channel();
        let rt = Runtime::new_client(Config::default(), tx);

        let mut backend = DummySoundBackend::new();
        assert!(backend.start(rt.clone(), 16).is_err());
        assert!(backend.start(rt.clone(), 1024).is_err());
        assert!(backend.start(rt, 128).is_ok());
        backend.stop();
    }

    #[test]
    fn stop_joins_the_callback_thread() {
        let (tx, _rx) = event_channel();
        let rt = Runtime::new_client(Config::default(), tx);

        let mut backend = DummySoundBackend::new();
        backend.start(rt, 64).unwrap();
        backend.stop();
    }
}
