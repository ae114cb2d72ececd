//! Audio device output — cpal stream fed through a lock-free ring buffer.
//!
//! The device owns the cpal output stream; rendered samples travel from
//! the render loop to the audio callback through an SPSC ring buffer.
//! [`AudioDev::write`] blocks (briefly sleeping) while the ring is full,
//! which paces rendering to playback speed.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use ringbuf::{
    traits::{Consumer, Producer, Split},
    HeapProd, HeapRb,
};

/// Ring buffer capacity in frames.
const RING_FRAMES: usize = 16384;

/// Audio device errors.
#[derive(Debug)]
pub enum AudioError {
    /// No audio output device found.
    NoOutputDevice,
    /// Failed to query device configuration.
    DeviceConfig(String),
    /// Failed to build the audio stream.
    StreamBuild(String),
    /// Failed to start the audio stream.
    StreamPlay(String),
}

impl std::fmt::Display for AudioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AudioError::NoOutputDevice => write!(f, "no audio output device found"),
            AudioError::DeviceConfig(e) => write!(f, "device config error: {e}"),
            AudioError::StreamBuild(e) => write!(f, "stream build error: {e}"),
            AudioError::StreamPlay(e) => write!(f, "stream play error: {e}"),
        }
    }
}

impl std::error::Error for AudioError {}

/// An open audio output with a negotiated sample rate.
pub struct AudioDev {
    _stream: cpal::Stream,
    producer: HeapProd<i16>,
    srate: u32,
    channels: u16,
}

impl AudioDev {
    /// Open the default output device, requesting `srate`. If the device
    /// rejects the rate, its default rate is used instead; check
    /// [`srate`](AudioDev::srate) for the rate actually in effect.
    pub fn open(channels: u16, srate: u32) -> Result<Self, AudioError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or(AudioError::NoOutputDevice)?;
        match Self::build(&device, channels, srate) {
            Ok(dev) => Ok(dev),
            Err(first_err) => {
                let config = device
                    .default_output_config()
                    .map_err(|e| AudioError::DeviceConfig(e.to_string()))?;
                let fallback = config.sample_rate().0;
                if fallback == srate {
                    return Err(first_err);
                }
                Self::build(&device, channels, fallback)
            }
        }
    }

    fn build(device: &cpal::Device, channels: u16, srate: u32) -> Result<Self, AudioError> {
        let rb = HeapRb::<i16>::new(RING_FRAMES * channels as usize);
        let (producer, mut consumer) = rb.split();
        let config = cpal::StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(srate),
            buffer_size: cpal::BufferSize::Default,
        };
        let err_fn = |err: cpal::StreamError| {
            eprintln!("audio stream error: {err}");
        };
        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    for d in data.iter_mut() {
                        *d = match consumer.try_pop() {
                            Some(s) => s as f32 / 32768.0,
                            None => 0.0,
                        };
                    }
                },
                err_fn,
                None,
            )
            .map_err(|e| AudioError::StreamBuild(e.to_string()))?;
        stream
            .play()
            .map_err(|e| AudioError::StreamPlay(e.to_string()))?;
        Ok(Self {
            _stream: stream,
            producer,
            srate,
            channels,
        })
    }

    /// The sample rate in effect.
    pub fn srate(&self) -> u32 {
        self.srate
    }

    /// The number of output channels.
    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Write interleaved samples, blocking while the ring is full.
    pub fn write(&mut self, samples: &[i16]) -> Result<(), AudioError> {
        let mut rest = samples;
        while !rest.is_empty() {
            let n = self.producer.push_slice(rest);
            rest = &rest[n..];
            if !rest.is_empty() {
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
        }
        Ok(())
    }
}
