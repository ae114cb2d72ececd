//! Error types for the SAU compiler.

use std::fmt;

/// An error that occurred while compiling a SAU script.
///
/// Syntax problems are reported as warnings and recovered from; a
/// `CompileError` is only produced for failures that prevent building
/// a program at all.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub message: String,
    pub line: u32,
    pub col: u32,
    pub kind: ErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ScanError,
    ParseError,
    BuildError,
}

impl CompileError {
    pub fn scan(message: impl Into<String>, line: u32, col: u32) -> Self {
        Self {
            message: message.into(),
            line,
            col,
            kind: ErrorKind::ScanError,
        }
    }

    pub fn parse(message: impl Into<String>, line: u32, col: u32) -> Self {
        Self {
            message: message.into(),
            line,
            col,
            kind: ErrorKind::ParseError,
        }
    }

    pub fn build(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line: 0,
            col: 0,
            kind: ErrorKind::BuildError,
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}:{}] {:?}: {}",
            self.line, self.col, self.kind, self.message
        )
    }
}

impl std::error::Error for CompileError {}
