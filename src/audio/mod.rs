//! Output sinks and render orchestration.
//!
//! A program renders to an audio device and/or a WAV file in fixed-size
//! chunks. When both sinks are active but the device negotiated a
//! different sample rate than requested, the program is rendered twice,
//! once per rate, with a warning.

pub mod device;
pub mod wav;

use std::path::Path;

pub use device::{AudioDev, AudioError};
pub use wav::WavFile;

use crate::gen::Generator;
use crate::program::Program;

/// Frames per render/write chunk.
const BUF_FRAMES: usize = 1024;
const NUM_CHANNELS: u16 = 2;

/// Render `prg` at `srate`, sending output to the given sinks.
///
/// Returns true unless a write error occurred. Rendering continues on
/// the remaining sink after a failure.
fn produce_audio(
    prg: &Program,
    srate: u32,
    mut ad: Option<&mut AudioDev>,
    mut wf: Option<&mut WavFile>,
) -> bool {
    let mut gen = Generator::new(prg, srate);
    let mut buf = vec![0i16; BUF_FRAMES * NUM_CHANNELS as usize];
    let mut ad_failed = false;
    let mut wf_failed = false;
    loop {
        let (frames, done) = gen.run(&mut buf);
        let samples = &buf[..frames * NUM_CHANNELS as usize];
        if let Some(ad) = ad.as_deref_mut() {
            if !ad_failed && ad.write(samples).is_err() {
                ad_failed = true;
                eprintln!("error: audio device write failed");
            }
        }
        if let Some(wf) = wf.as_deref_mut() {
            if !wf_failed {
                if let Err(e) = wf.write(samples) {
                    wf_failed = true;
                    eprintln!("error: WAV file write failed: {e}");
                }
            }
        }
        if done {
            break;
        }
    }
    !(ad_failed || wf_failed)
}

/// Run the program through the generator until completion, writing to
/// none, one, or both of the audio device and a WAV file.
pub fn render_program(
    prg: &Program,
    srate: u32,
    use_audiodev: bool,
    wav_path: Option<&Path>,
) -> bool {
    let mut ad = None;
    let mut ad_srate = srate;
    if use_audiodev {
        match AudioDev::open(NUM_CHANNELS, srate) {
            Ok(dev) => {
                ad_srate = dev.srate();
                ad = Some(dev);
            }
            Err(e) => {
                eprintln!("error: couldn't open audio device: {e}");
                return false;
            }
        }
    }
    let mut wf = None;
    if let Some(path) = wav_path {
        match WavFile::create(path, NUM_CHANNELS, srate) {
            Ok(w) => wf = Some(w),
            Err(e) => {
                eprintln!(
                    "error: couldn't open WAV file \"{}\" for writing: {e}",
                    path.display()
                );
                return false;
            }
        }
    }

    let mut status;
    if ad.is_some() && wf.is_some() && ad_srate != srate {
        eprintln!("warning: generating audio twice, using different sample rates");
        status = produce_audio(prg, ad_srate, ad.as_mut(), None);
        status = produce_audio(prg, srate, None, wf.as_mut()) && status;
    } else {
        status = produce_audio(prg, ad_srate, ad.as_mut(), wf.as_mut());
    }

    if let Some(w) = wf {
        if let Err(e) = w.finalize() {
            eprintln!("error: WAV file close failed: {e}");
            status = false;
        }
    }
    status
}
