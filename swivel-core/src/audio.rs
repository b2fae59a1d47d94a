//! # Audio Capture Module
//!
//! The boundary between the audio device and per-string analysis.
//!
//! - [`AudioCallback`] is anything that can consume mono blocks.
//! - [`AudioRouter`] holds at most one attached callback and feeds it the
//!   configured input channel, or a mixdown of all of them, from the
//!   interleaved blocks the device delivers.
//! - [`start_audio_capture`] opens the default cpal input device and drives a
//!   router from its stream.
//!
//! The device callback never waits: if the slot is locked because the
//! sequencer is attaching or detaching, that block is dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{Result, anyhow};
use cpal::SupportedStreamConfigRange;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

/// Sample rate asked of the device when it supports it.
pub const TARGET_SAMPLE_RATE: u32 = 44100;

/// Consumer of mono audio blocks, called from the real-time audio thread.
pub trait AudioCallback: Send {
    fn on_block(&mut self, samples: &[f32], sample_rate: f64);
}

/// A live audio source analysis callbacks can be attached to.
pub trait AudioSource: Send + Sync {
    /// Replaces the attached callback. Returns once the previous one, if any,
    /// is no longer running.
    fn attach(&self, callback: Box<dyn AudioCallback>);

    /// Removes the attached callback. Once this returns it will not be called again.
    fn detach(&self) -> Option<Box<dyn AudioCallback>>;

    fn sample_rate(&self) -> f64;
}

/// Which part of a multi-channel input is analysed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputChannel {
    /// A single 0-based channel; clamped to the last channel the device has.
    Channel(usize),
    /// The average of every channel.
    Mixdown,
}

impl Default for InputChannel {
    fn default() -> Self {
        InputChannel::Channel(0)
    }
}

impl InputChannel {
    /// Writes the selected mono signal of `interleaved` into `out`.
    pub fn extract(self, interleaved: &[f32], channels: usize, out: &mut Vec<f32>) {
        out.clear();
        let channels = channels.max(1);
        match self {
            InputChannel::Channel(ch) => {
                let ch = ch.min(channels - 1);
                out.extend(interleaved.chunks_exact(channels).map(|frame| frame[ch]));
            }
            InputChannel::Mixdown => {
                let scale = 1.0 / channels as f32;
                out.extend(
                    interleaved
                        .chunks_exact(channels)
                        .map(|frame| frame.iter().sum::<f32>() * scale),
                );
            }
        }
    }
}

#[derive(Default)]
struct Slot {
    callback: Option<Box<dyn AudioCallback>>,
    mono: Vec<f32>,
}

/// Fans the device stream out to whichever callback is currently attached.
pub struct AudioRouter {
    input: InputChannel,
    sample_rate: AtomicU32,
    slot: Mutex<Slot>,
}

impl AudioRouter {
    /// Creates a router with nothing attached.
    ///
    /// # Arguments
    /// * `input` - Which channel, or the mixdown, callbacks receive
    /// * `sample_rate` - Reported to callbacks until [`set_sample_rate`](Self::set_sample_rate) changes it
    pub fn new(input: InputChannel, sample_rate: u32) -> Self {
        Self {
            input,
            sample_rate: AtomicU32::new(sample_rate),
            slot: Mutex::new(Slot::default()),
        }
    }

    pub fn input(&self) -> InputChannel {
        self.input
    }

    pub fn set_sample_rate(&self, sample_rate: u32) {
        self.sample_rate.store(sample_rate, Ordering::Relaxed);
    }

    pub fn is_attached(&self) -> bool {
        self.slot.lock().callback.is_some()
    }

    /// Feeds one interleaved device block to the attached callback.
    ///
    /// Returns `false` if the block was not delivered, either because nothing
    /// is attached or because the slot was busy.
    ///
    /// The slot stays locked while the callback runs, FFT included. Only
    /// [`AudioSource::attach`] and [`AudioSource::detach`] ever wait on it, so a
    /// detached callback is guaranteed not to be mid-block.
    pub fn process(&self, interleaved: &[f32], channels: usize) -> bool {
        let Some(mut slot) = self.slot.try_lock() else {
            return false;
        };
        let Slot { callback, mono } = &mut *slot;
        let Some(callback) = callback.as_mut() else {
            return false;
        };
        self.input.extract(interleaved, channels, mono);
        callback.on_block(mono, self.sample_rate());
        true
    }
}

impl AudioSource for AudioRouter {
    fn attach(&self, callback: Box<dyn AudioCallback>) {
        self.slot.lock().callback = Some(callback);
    }

    fn detach(&self) -> Option<Box<dyn AudioCallback>> {
        self.slot.lock().callback.take()
    }

    fn sample_rate(&self) -> f64 {
        self.sample_rate.load(Ordering::Relaxed) as f64
    }
}

/// Starts audio capture from the default input device into `router`.
///
/// The router's sample rate is set to whatever the device was opened at.
///
/// # Returns
/// * `Ok((stream, sample_rate))` - the running stream, which must be kept alive,
///   and its sample rate
/// * `Err(e)` - no input device, or none with a usable f32 format
pub fn start_audio_capture(router: Arc<AudioRouter>) -> Result<(cpal::Stream, u32)> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| anyhow!("No input device available"))?;

    info!("Using audio input device: {}", device.name()?);

    let min_channels = match router.input() {
        InputChannel::Channel(ch) => ch as u16 + 1,
        InputChannel::Mixdown => 1,
    };
    let configs = device.supported_input_configs()?.collect::<Vec<_>>();
    let supported_config = find_supported_config(configs, TARGET_SAMPLE_RATE, min_channels)
        .ok_or_else(|| anyhow!("No suitable f32 input format found"))?;

    let rate = TARGET_SAMPLE_RATE.clamp(
        supported_config.min_sample_rate().0,
        supported_config.max_sample_rate().0,
    );
    let config = supported_config.with_sample_rate(cpal::SampleRate(rate));
    let sample_rate_val = config.sample_rate().0;
    let channels = config.channels() as usize;
    let config: cpal::StreamConfig = config.into();

    info!("Selected sample rate: {sample_rate_val} Hz, {channels} channel(s)");
    router.set_sample_rate(sample_rate_val);

    let err_fn = |err| error!("An error occurred on the audio stream: {err}");

    let stream = device.build_input_stream(
        &config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            router.process(data, channels);
        },
        err_fn,
        None,
    )?;

    stream.play()?;

    Ok((stream, sample_rate_val))
}

/// Picks the f32 configuration with enough channels whose sample-rate range
/// comes closest to `target_rate`, preferring fewer channels.
fn find_supported_config(
    configs: Vec<SupportedStreamConfigRange>,
    target_rate: u32,
    min_channels: u16,
) -> Option<SupportedStreamConfigRange> {
    configs
        .into_iter()
        .filter(|c| c.channels() >= min_channels && c.sample_format() == cpal::SampleFormat::F32)
        .min_by_key(|c| {
            let (min, max) = (c.min_sample_rate().0, c.max_sample_rate().0);
            let distance = if (min..=max).contains(&target_rate) {
                0
            } else {
                min.abs_diff(target_rate).min(max.abs_diff(target_rate))
            };
            (distance, c.channels())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder(Arc<Mutex<Vec<(Vec<f32>, f64)>>>);

    impl AudioCallback for Recorder {
        fn on_block(&mut self, samples: &[f32], sample_rate: f64) {
            self.0.lock().push((samples.to_vec(), sample_rate));
        }
    }

    fn recorder() -> (Box<dyn AudioCallback>, Arc<Mutex<Vec<(Vec<f32>, f64)>>>) {
        let blocks = Arc::new(Mutex::new(Vec::new()));
        (Box::new(Recorder(Arc::clone(&blocks))), blocks)
    }

    #[test]
    fn test_channel_selection() {
        let stereo = [1.0, -1.0, 2.0, -2.0, 3.0, -3.0];
        let mut out = Vec::new();

        InputChannel::Channel(1).extract(&stereo, 2, &mut out);
        assert_eq!(out, vec![-1.0, -2.0, -3.0]);
        InputChannel::Channel(5).extract(&stereo, 2, &mut out);
        assert_eq!(out, vec![-1.0, -2.0, -3.0]);
        InputChannel::Mixdown.extract(&stereo, 2, &mut out);
        assert_eq!(out, vec![0.0, 0.0, 0.0]);
        InputChannel::Channel(0).extract(&stereo, 1, &mut out);
        assert_eq!(out.len(), 6);
    }

    #[test]
    fn test_attach_detach() {
        let router = AudioRouter::new(InputChannel::Channel(0), 48000);
        assert!(!router.process(&[0.5; 4], 1));

        let (callback, blocks) = recorder();
        router.attach(callback);
        assert!(router.is_attached());
        assert!(router.process(&[0.1, 0.2, 0.3, 0.4], 2));

        assert!(router.detach().is_some());
        assert!(!router.process(&[0.5; 4], 1));
        assert!(router.detach().is_none());

        let blocks = blocks.lock();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0], (vec![0.1, 0.3], 48000.0));
    }

    #[test]
    fn test_detach_waits_for_block_in_flight() {
        use std::sync::atomic::AtomicBool;
        use std::thread;
        use std::time::Duration;

        struct Slow {
            entered: crossbeam_channel::Sender<()>,
            done: Arc<AtomicBool>,
        }

        impl AudioCallback for Slow {
            fn on_block(&mut self, _samples: &[f32], _sample_rate: f64) {
                let _ = self.entered.send(());
                thread::sleep(Duration::from_millis(50));
                self.done.store(true, Ordering::SeqCst);
            }
        }

        let router = Arc::new(AudioRouter::new(InputChannel::Channel(0), 48000));
        let (entered_tx, entered_rx) = crossbeam_channel::bounded(1);
        let done = Arc::new(AtomicBool::new(false));
        router.attach(Box::new(Slow {
            entered: entered_tx,
            done: Arc::clone(&done),
        }));

        let audio = {
            let router = Arc::clone(&router);
            thread::spawn(move || router.process(&[0.5; 8], 1))
        };
        entered_rx.recv().unwrap();
        // A second block arriving mid-callback is dropped, not queued.
        assert!(!router.process(&[0.5; 8], 1));

        assert!(router.detach().is_some());
        assert!(done.load(Ordering::SeqCst));
        assert!(audio.join().unwrap());
    }

    #[test]
    fn test_input_channel_config_format() {
        let ch: InputChannel = serde_json::from_str(r#"{"channel": 2}"#).unwrap();
        assert_eq!(ch, InputChannel::Channel(2));
        let mix: InputChannel = serde_json::from_str(r#""mixdown""#).unwrap();
        assert_eq!(mix, InputChannel::Mixdown);
    }
}
