//! Undertone — a scriptable audio synthesizer.
//!
//! Compiles SAU scripts (oscillator graphs with phase, frequency and
//! amplitude modulation, per-operator timing, composite events and
//! group timing) into a linear event program, then interprets that
//! program into 16-bit stereo PCM for an audio device and/or WAV file.

pub mod audio;
pub mod dsl;
pub mod gen;
pub mod program;
