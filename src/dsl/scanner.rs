//! Byte scanner for SAU scripts.
//!
//! Provides the small reading interface the parser is built on: filtered
//! `getc` with one-level `ungetc`, `tryc`, symbol and number reads, and
//! warnings carrying the current script position. Whitespace runs collapse
//! to a single [`SPACE`] and line-break runs to a single [`LNBRK`]; inside
//! numeric expressions the parser switches whitespace reporting off
//! entirely. `#!` starts a line comment and `#Q` ends the input.

/// Returned at end of input.
pub const EOF: u8 = 0;
/// Returned for a run of spaces and tabs.
pub const SPACE: u8 = b' ';
/// Returned for a run of line breaks.
pub const LNBRK: u8 = b'\n';

/// Whitespace reporting mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsMode {
    /// Report collapsed SPACE/LNBRK markers.
    Keep,
    /// Silently skip all whitespace (numeric expressions).
    None,
}

/// A saved stream position, used for `ungetc` and multi-character
/// constant parsing.
#[derive(Debug, Clone, Copy)]
pub struct Frame {
    pos: usize,
    pub line: u32,
    pub col: u32,
}

pub struct Scanner {
    name: String,
    src: Vec<u8>,
    pos: usize,
    line: u32,
    col: u32,
    ws_mode: WsMode,
    last: Option<Frame>,
    closed: bool,
    warnings: u32,
}

impl Scanner {
    pub fn new(source: &str, name: &str) -> Self {
        Self {
            name: name.to_string(),
            src: source.as_bytes().to_vec(),
            pos: 0,
            line: 1,
            col: 1,
            ws_mode: WsMode::Keep,
            last: None,
            closed: false,
            warnings: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ws_mode(&self) -> WsMode {
        self.ws_mode
    }

    pub fn set_ws_mode(&mut self, mode: WsMode) {
        self.ws_mode = mode;
    }

    /// Current position, for later restore or warning attribution.
    pub fn frame(&self) -> Frame {
        Frame {
            pos: self.pos,
            line: self.line,
            col: self.col,
        }
    }

    /// Rewind to a previously saved position.
    pub fn restore(&mut self, f: Frame) {
        self.pos = f.pos;
        self.line = f.line;
        self.col = f.col;
        self.last = None;
    }

    fn peek_raw(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    /// Read one raw byte, tracking line and column.
    pub fn getc_raw(&mut self) -> u8 {
        match self.src.get(self.pos).copied() {
            None => EOF,
            Some(b) => {
                self.pos += 1;
                if b == b'\n' {
                    self.line += 1;
                    self.col = 1;
                } else {
                    self.col += 1;
                }
                b
            }
        }
    }

    /// Filtered read: collapses whitespace, strips comments, handles `#Q`.
    pub fn getc(&mut self) -> u8 {
        let frame = self.frame();
        let c = self.getc_filtered();
        self.last = Some(frame);
        c
    }

    fn getc_filtered(&mut self) -> u8 {
        if self.closed {
            return EOF;
        }
        loop {
            let b = match self.peek_raw() {
                None => return EOF,
                Some(b) => b,
            };
            match b {
                b' ' | b'\t' | b'\r' => {
                    while matches!(self.peek_raw(), Some(b' ' | b'\t' | b'\r')) {
                        self.getc_raw();
                    }
                    if self.ws_mode == WsMode::Keep {
                        return SPACE;
                    }
                }
                b'\n' => {
                    while matches!(self.peek_raw(), Some(b'\n' | b'\r')) {
                        self.getc_raw();
                    }
                    if self.ws_mode == WsMode::Keep {
                        return LNBRK;
                    }
                }
                b'#' => match self.src.get(self.pos + 1).copied() {
                    Some(b'!') => {
                        while !matches!(self.peek_raw(), None | Some(b'\n')) {
                            self.getc_raw();
                        }
                    }
                    Some(b'Q') => {
                        self.closed = true;
                        return EOF;
                    }
                    _ => {
                        self.getc_raw();
                        return b'#';
                    }
                },
                _ => {
                    self.getc_raw();
                    return b;
                }
            }
        }
    }

    /// Put the last `getc` result back. Only one level is kept.
    pub fn ungetc(&mut self) {
        if let Some(f) = self.last.take() {
            self.restore(f);
        }
    }

    /// Consume the next filtered byte iff it equals `c`.
    pub fn tryc(&mut self, c: u8) -> bool {
        if self.getc() == c {
            true
        } else {
            self.ungetc();
            false
        }
    }

    pub(crate) fn skip_space(&mut self) {
        while matches!(self.peek_raw(), Some(b' ' | b'\t' | b'\r')) {
            self.getc_raw();
        }
    }

    /// Read an identifier (`[A-Za-z0-9_]+`), skipping leading spaces.
    /// Returns `None` if no identifier characters follow.
    pub fn get_symstr(&mut self) -> Option<String> {
        self.skip_space();
        let mut s = String::new();
        while let Some(b) = self.peek_raw() {
            if b.is_ascii_alphanumeric() || b == b'_' {
                s.push(self.getc_raw() as char);
            } else {
                break;
            }
        }
        if s.is_empty() {
            None
        } else {
            Some(s)
        }
    }

    /// Read an unsigned decimal literal (`123`, `1.5`, `.5`).
    /// Returns `None` when no digits were read.
    pub fn getd(&mut self) -> Option<f64> {
        self.skip_space();
        let start = self.frame();
        let mut s = String::new();
        while matches!(self.peek_raw(), Some(b'0'..=b'9')) {
            s.push(self.getc_raw() as char);
        }
        if self.peek_raw() == Some(b'.')
            && matches!(self.src.get(self.pos + 1), Some(b'0'..=b'9'))
        {
            s.push(self.getc_raw() as char);
            while matches!(self.peek_raw(), Some(b'0'..=b'9')) {
                s.push(self.getc_raw() as char);
            }
        } else if self.peek_raw() == Some(b'.') && !s.is_empty() {
            // trailing dot with no fraction digits belongs to the number
            s.push(self.getc_raw() as char);
        }
        if s.is_empty() {
            self.restore(start);
            return None;
        }
        s.parse().ok()
    }

    /// Read an unsigned decimal integer, returning the value and the
    /// number of digits consumed.
    pub fn geti(&mut self) -> (u32, usize) {
        let mut val: u32 = 0;
        let mut len = 0;
        while let Some(b @ b'0'..=b'9') = self.peek_raw() {
            val = val.saturating_mul(10).saturating_add((b - b'0') as u32);
            self.getc_raw();
            len += 1;
        }
        (val, len)
    }

    /// Print a warning at the current position.
    pub fn warning(&mut self, msg: &str) {
        let f = self.frame();
        self.warning_at(&f, msg);
    }

    /// Print a warning at a saved position.
    pub fn warning_at(&mut self, f: &Frame, msg: &str) {
        self.warnings += 1;
        eprintln!("warning: {}:{}:{}: {}", self.name, f.line, f.col, msg);
    }

    pub fn warning_count(&self) -> u32 {
        self.warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_bytes_in_order() {
        let mut sc = Scanner::new("ab", "test");
        assert_eq!(sc.getc(), b'a');
        assert_eq!(sc.getc(), b'b');
        assert_eq!(sc.getc(), EOF);
    }

    #[test]
    fn collapses_space_runs() {
        let mut sc = Scanner::new("a   \t b", "test");
        assert_eq!(sc.getc(), b'a');
        assert_eq!(sc.getc(), SPACE);
        assert_eq!(sc.getc(), b'b');
    }

    #[test]
    fn collapses_linebreak_runs() {
        let mut sc = Scanner::new("a\n\n\nb", "test");
        assert_eq!(sc.getc(), b'a');
        assert_eq!(sc.getc(), LNBRK);
        assert_eq!(sc.getc(), b'b');
    }

    #[test]
    fn ws_mode_none_skips_everything() {
        let mut sc = Scanner::new("1 \n 2", "test");
        sc.set_ws_mode(WsMode::None);
        assert_eq!(sc.getc(), b'1');
        assert_eq!(sc.getc(), b'2');
    }

    #[test]
    fn line_comment_stripped() {
        let mut sc = Scanner::new("a #! comment\nb", "test");
        assert_eq!(sc.getc(), b'a');
        assert_eq!(sc.getc(), SPACE);
        assert_eq!(sc.getc(), LNBRK);
        assert_eq!(sc.getc(), b'b');
    }

    #[test]
    fn hash_q_ends_input() {
        let mut sc = Scanner::new("a#Qb", "test");
        assert_eq!(sc.getc(), b'a');
        assert_eq!(sc.getc(), EOF);
        assert_eq!(sc.getc(), EOF);
    }

    #[test]
    fn other_hash_passes_through() {
        let mut sc = Scanner::new("#x", "test");
        assert_eq!(sc.getc(), b'#');
        assert_eq!(sc.getc(), b'x');
    }

    #[test]
    fn ungetc_single_level() {
        let mut sc = Scanner::new("ab", "test");
        assert_eq!(sc.getc(), b'a');
        sc.ungetc();
        assert_eq!(sc.getc(), b'a');
        assert_eq!(sc.getc(), b'b');
    }

    #[test]
    fn tryc_consumes_only_on_match() {
        let mut sc = Scanner::new("xy", "test");
        assert!(!sc.tryc(b'y'));
        assert!(sc.tryc(b'x'));
        assert!(sc.tryc(b'y'));
    }

    #[test]
    fn symstr_reads_identifier() {
        let mut sc = Scanner::new("foo_1 bar", "test");
        assert_eq!(sc.get_symstr().as_deref(), Some("foo_1"));
        assert_eq!(sc.get_symstr().as_deref(), Some("bar"));
        assert_eq!(sc.get_symstr(), None);
    }

    #[test]
    fn getd_reads_decimals() {
        let mut sc = Scanner::new("12.5", "test");
        assert_eq!(sc.getd(), Some(12.5));
        let mut sc = Scanner::new(".25", "test");
        assert_eq!(sc.getd(), Some(0.25));
        let mut sc = Scanner::new("x", "test");
        assert_eq!(sc.getd(), None);
        assert_eq!(sc.getc(), b'x');
    }

    #[test]
    fn geti_counts_digits() {
        let mut sc = Scanner::new("10x", "test");
        assert_eq!(sc.geti(), (10, 2));
        assert_eq!(sc.getc(), b'x');
        let mut sc = Scanner::new("x", "test");
        assert_eq!(sc.geti(), (0, 0));
    }

    #[test]
    fn line_and_col_tracking() {
        let mut sc = Scanner::new("a\nbc", "test");
        sc.getc();
        sc.getc(); // LNBRK
        sc.getc(); // b
        let f = sc.frame();
        assert_eq!(f.line, 2);
        assert_eq!(f.col, 2);
    }

    #[test]
    fn restore_rewinds() {
        let mut sc = Scanner::new("abc", "test");
        let f = sc.frame();
        sc.getc();
        sc.getc();
        sc.restore(f);
        assert_eq!(sc.getc(), b'a');
    }
}
