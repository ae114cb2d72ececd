//! Note constants — parses names like `A4`, `Cs3`, `gEf5` into frequencies.
//!
//! Three just-intonation scales (flat, natural, sharp) over octaves 0–10.
//! The fundamental comes from the script's A4 tuning; C4 is `A4 * 3/5`.
//! A leading small letter is a subnote, blending linearly toward the next
//! note of the scale.

use super::scanner::Scanner;

const OCTAVES: usize = 11;

const OCTAVE_SCALE: [f32; OCTAVES] = [
    1.0 / 16.0,
    1.0 / 8.0,
    1.0 / 4.0,
    1.0 / 2.0,
    1.0, // octave 4, standard tuning
    2.0,
    4.0,
    8.0,
    16.0,
    32.0,
    64.0,
];

// flat, natural, sharp; the 8th entry is the octave above for subnote blending
const NOTES: [[f32; 8]; 3] = [
    [
        48.0 / 25.0,
        16.0 / 15.0,
        6.0 / 5.0,
        32.0 / 25.0,
        36.0 / 25.0,
        8.0 / 5.0,
        9.0 / 5.0,
        96.0 / 25.0,
    ],
    // normal (9/8 replaced with 10/9 for symmetry)
    [
        1.0,
        10.0 / 9.0,
        5.0 / 4.0,
        4.0 / 3.0,
        3.0 / 2.0,
        5.0 / 3.0,
        15.0 / 8.0,
        2.0,
    ],
    [
        25.0 / 24.0,
        75.0 / 64.0,
        125.0 / 96.0,
        25.0 / 18.0,
        25.0 / 16.0,
        225.0 / 128.0,
        125.0 / 64.0,
        25.0 / 12.0,
    ],
];

/// Scan a note constant at the current position.
///
/// On failure the scanner is rewound and `None` returned, so the caller
/// can fall back to a plain number.
pub fn scan_note(sc: &mut Scanner, a4_freq: f32) -> Option<f64> {
    let start = sc.frame();
    let mut c = sc.getc_raw();
    let mut subnote: i32 = -1;
    if (b'a'..=b'g').contains(&c) {
        subnote = c as i32 - b'c' as i32;
        if subnote < 0 {
            subnote += 7;
        }
        c = sc.getc_raw();
    }
    if !(b'A'..=b'G').contains(&c) {
        sc.restore(start);
        return None;
    }
    let mut note = c as i32 - b'C' as i32;
    if note < 0 {
        note += 7;
    }
    let save = sc.frame();
    c = sc.getc_raw();
    let semitone: usize = match c {
        b's' => 2,
        b'f' => 0,
        _ => {
            sc.restore(save);
            1
        }
    };
    let (mut octave, num_len) = sc.geti();
    if num_len == 0 {
        octave = 4;
    } else if octave as usize >= OCTAVES {
        sc.warning("invalid octave specified for note, using 4 (valid range 0-10)");
        octave = 4;
    }
    let note = note as usize;
    let mut freq = a4_freq * (3.0 / 5.0); // C4
    freq *= OCTAVE_SCALE[octave as usize] * NOTES[semitone][note];
    if subnote >= 0 {
        freq *= 1.0
            + (NOTES[semitone][note + 1] / NOTES[semitone][note] - 1.0)
                * (NOTES[1][subnote as usize] - 1.0);
    }
    Some(freq as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Option<f64> {
        let mut sc = Scanner::new(s, "test");
        scan_note(&mut sc, 444.0)
    }

    #[test]
    fn a4_is_tuning_times_five_thirds_of_c4() {
        // C4 = 444 * 3/5 = 266.4; A4 = C4 * 5/3 = 444
        let f = parse("A4").unwrap();
        assert!((f - 444.0).abs() < 1e-3);
    }

    #[test]
    fn c4_is_three_fifths_of_tuning() {
        let f = parse("C4").unwrap();
        assert!((f - 266.4).abs() < 1e-3);
    }

    #[test]
    fn default_octave_is_4() {
        assert_eq!(parse("C"), parse("C4"));
    }

    #[test]
    fn octave_doubles() {
        let f4 = parse("C4").unwrap();
        let f5 = parse("C5").unwrap();
        assert!((f5 / f4 - 2.0).abs() < 1e-6);
    }

    #[test]
    fn sharp_above_natural() {
        assert!(parse("Cs4").unwrap() > parse("C4").unwrap());
    }

    #[test]
    fn flat_below_octave_natural() {
        // Cf is in the flat scale, above C natural of the same octave index
        // by its just ratio; it stays within the octave
        let cf = parse("Cf4").unwrap();
        assert!(cf > parse("C3").unwrap() && cf < parse("C5").unwrap());
    }

    #[test]
    fn fifth_ratio() {
        let c = parse("C4").unwrap();
        let g = parse("G4").unwrap();
        assert!((g / c - 1.5).abs() < 1e-6);
    }

    #[test]
    fn subnote_blends_upward() {
        let c = parse("C4").unwrap();
        let d = parse("D4").unwrap();
        let blended = parse("eC4").unwrap();
        assert!(blended > c && blended < d);
    }

    #[test]
    fn non_note_rewinds() {
        let mut sc = Scanner::new("x1", "test");
        assert!(scan_note(&mut sc, 444.0).is_none());
        assert_eq!(sc.getc(), b'x');
    }

    #[test]
    fn invalid_octave_falls_back() {
        let f = parse("C12").unwrap();
        assert_eq!(f, parse("C4").unwrap());
    }
}
