//! Full pipeline tests: SAU source → program → rendered PCM.

use undertone::dsl::Compiler;
use undertone::gen::Generator;
use undertone::program::Program;

fn build(src: &str) -> Program {
    Compiler::compile(src, "test").expect("compile failed")
}

fn render(src: &str, srate: u32) -> Vec<i16> {
    let prg = build(src);
    let mut gen = Generator::new(&prg, srate);
    let mut out = Vec::new();
    let mut buf = [0i16; 2048];
    for _ in 0..1_000_000 {
        let (frames, done) = gen.run(&mut buf);
        out.extend_from_slice(&buf[..frames * 2]);
        if done {
            return out;
        }
    }
    panic!("generator did not finish");
}

fn peak(frames: &[i16]) -> i32 {
    frames.iter().map(|&v| (v as i32).abs()).max().unwrap_or(0)
}

fn left_zero_crossings(frames: &[i16]) -> usize {
    let mut count = 0;
    let mut prev = frames[0];
    for f in frames.chunks(2).skip(1) {
        if (prev < 0) != (f[0] < 0) && f[0] != 0 {
            count += 1;
        }
        prev = f[0];
    }
    count
}

#[test]
fn silence_only_settings() {
    let out = render("S t0", 44100);
    assert!(out.is_empty(), "settings-only script produced sound");
}

#[test]
fn single_sine_half_second_48k() {
    let out = render("Osin t0.5 f440", 48000);
    let frames = out.len() / 2;
    // half a second, shortened at most one wave cycle by the time snap
    assert!(frames <= 24000, "frames {frames}");
    assert!(frames >= 24000 - 110, "frames {frames}");
    // both channels equal for centred pan
    for f in out.chunks(2) {
        assert_eq!(f[0], f[1]);
    }
    assert!(peak(&out) <= i16::MAX as i32);
    // dominant frequency 440 Hz: two crossings per cycle
    let zc = left_zero_crossings(&out) as f64;
    let expected = 2.0 * 440.0 * frames as f64 / 48000.0;
    assert!((zc - expected).abs() < expected * 0.05, "zc {zc} vs {expected}");
}

#[test]
fn fm_rumble_nested_phase_modulation() {
    let out = render("Osin f137 t1 p+[Osin f32 p+[Osin f42]]", 44100);
    let frames = out.len() / 2;
    assert!(frames <= 44100 && frames > 43700, "frames {frames}");
    let p = peak(&out);
    assert!(p > 4000, "no energy in output");
    assert!(p < i16::MAX as i32, "clipped output");
    // energy concentrated in the low range: crossing rate far below
    // a 1 kHz tone's
    let zc = left_zero_crossings(&out);
    assert!(zc < 2000 * frames / 44100, "zc {zc}");
}

#[test]
fn composite_three_segments() {
    let out = render("Osin f440 t0.1; t0.1 f880; t0.1 f1320", 44100);
    let frames = out.len() / 2;
    // 0.3 s total, allowing for per-segment snaps
    assert!(frames <= 13230 && frames > 12500, "frames {frames}");
    let seg = 4410;
    let zc1 = left_zero_crossings(&out[..seg * 2]);
    let zc2 = left_zero_crossings(&out[seg * 2..2 * seg * 2]);
    let end = (3 * seg * 2).min(out.len());
    let zc3 = left_zero_crossings(&out[2 * seg * 2..end]);
    // step frequency transitions: each segment roughly doubles/rises
    assert!(zc2 > zc1 * 3 / 2, "zc1 {zc1} zc2 {zc2}");
    assert!(zc3 > zc2, "zc2 {zc2} zc3 {zc3}");
}

#[test]
fn wait_for_previous_duration() {
    let out = render("Osin f200 t0.5 \\t Osin f400 t0.5", 44100);
    let frames = out.len() / 2;
    assert!(frames > 43000 && frames <= 44100, "frames {frames}");
    // first half is the 200 Hz operator, second half the 400 Hz one
    let a = &out[2000..40000];
    let b_start = 25000 * 2;
    let b = &out[b_start..b_start + 38000.min(out.len() - b_start)];
    let zc_a = left_zero_crossings(a) as f64 / (a.len() / 2) as f64;
    let zc_b = left_zero_crossings(b) as f64 / (b.len() / 2) as f64;
    assert!(zc_b > zc_a * 1.5, "rate a {zc_a} rate b {zc_b}");
}

#[test]
fn group_synchronises_durations() {
    let out = render("Osin f100 t1 Osin f150 Osin f200 t2", 44100);
    let frames = out.len() / 2;
    // the group's longest operator sets the total length
    assert!(frames <= 88200 && frames > 87000, "frames {frames}");
    // the untimed middle operator sounds to the end as well
    let tail = &out[(frames - 4000) * 2..];
    assert!(peak(tail) > 2000, "tail silent");
}

#[test]
fn group_wait_shifts_following_voice() {
    let out = render("Osin f300 t0.5 |\nOsin f300 t0.5", 44100);
    let frames = out.len() / 2;
    // two half-second tones in sequence
    assert!(frames > 43000 && frames <= 44100, "frames {frames}");
}

#[test]
fn default_time_one_second() {
    let out = render("Osin f440", 44100);
    let frames = out.len() / 2;
    assert!(frames <= 44100 && frames > 43900, "frames {frames}");
}

#[test]
fn building_twice_gives_identical_pcm() {
    let src = "Osin f330 t0.2 p+[Osin f47] a{v0.2 t0.2}";
    let a = render(src, 44100);
    let b = render(src, 44100);
    assert_eq!(a, b);
}

#[test]
fn empty_source_is_empty_program() {
    let prg = build("");
    assert!(prg.events.is_empty());
    let out = render("", 44100);
    assert!(out.is_empty());
}

#[test]
fn syntax_errors_do_not_abort_build() {
    // the invalid step is skipped with a warning; the script still plays
    let out = render("Osin f440 t0.1 ?", 44100);
    assert!(!out.is_empty());
}

#[test]
fn infinite_nested_time_follows_carrier() {
    let out = render("Osin f100 t0.2 p+[Osin f7 ti]", 44100);
    let frames = out.len() / 2;
    assert!(frames <= 8820, "frames {frames}");
    assert!(peak(&out) > 4000);
}

#[test]
fn negative_wait_discarded_with_warning() {
    // the negative wait is dropped; both operators start together
    let out = render("Osin f200 t0.1 \\(0-1) f300", 44100);
    let frames = out.len() / 2;
    assert!(frames <= 4410, "frames {frames}");
}

#[test]
fn program_is_shareable_between_generators() {
    let prg = build("Osin f440 t0.1");
    let mut g1 = Generator::new(&prg, 44100);
    let mut g2 = Generator::new(&prg, 44100);
    let mut b1 = [0i16; 512];
    let mut b2 = [0i16; 512];
    let _ = g1.run(&mut b1);
    let _ = g2.run(&mut b2);
    assert_eq!(b1, b2);
}

#[test]
fn wav_output_end_to_end() {
    use undertone::audio::render_program;
    let file = tempfile::NamedTempFile::new().unwrap();
    let prg = build("Osin f440 t0.25");
    assert!(render_program(&prg, 48000, false, Some(file.path())));
    let reader = hound::WavReader::open(file.path()).unwrap();
    let spec = reader.spec();
    assert_eq!(spec.channels, 2);
    assert_eq!(spec.sample_rate, 48000);
    assert_eq!(spec.bits_per_sample, 16);
    let frames = reader.len() / 2;
    assert!(frames <= 12000 && frames > 11500, "frames {frames}");
}
