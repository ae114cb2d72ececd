//! WAV file output — 16-bit PCM via hound.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use hound::{SampleFormat, WavSpec, WavWriter};

/// A 16-bit PCM WAV file being written.
pub struct WavFile {
    writer: WavWriter<BufWriter<File>>,
    channels: u16,
    samples_written: u64,
}

impl WavFile {
    pub fn create(path: &Path, channels: u16, srate: u32) -> Result<Self, hound::Error> {
        let spec = WavSpec {
            channels,
            sample_rate: srate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let writer = WavWriter::create(path, spec)?;
        Ok(Self {
            writer,
            channels,
            samples_written: 0,
        })
    }

    /// Write interleaved samples.
    pub fn write(&mut self, samples: &[i16]) -> Result<(), hound::Error> {
        for &s in samples {
            self.writer.write_sample(s)?;
        }
        self.samples_written += samples.len() as u64;
        Ok(())
    }

    /// Frames written so far.
    pub fn frames_written(&self) -> u64 {
        self.samples_written / self.channels as u64
    }

    /// Close the file, patching the header with the final data length.
    pub fn finalize(self) -> Result<(), hound::Error> {
        self.writer.finalize()
    }
}
