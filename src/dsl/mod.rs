//! SAU compiler — script source → parse graph → script graph → program.

pub mod ast;
pub mod error;
pub mod lower;
pub mod note;
pub mod parser;
pub mod scanner;
pub mod script;

pub use ast::ParseGraph;
pub use error::CompileError;

use crate::program::build::build_program;
use crate::program::Program;

/// The SAU compiler.
///
/// Parses source text into a parse graph, lowers it (timing inference,
/// grouping, composite flattening, adjacency construction) and builds
/// the linear event program.
pub struct Compiler;

impl Compiler {
    /// Parse SAU source into a parse graph. Syntax errors are reported
    /// as warnings on stderr; parsing always yields a graph.
    pub fn parse(source: &str, name: &str) -> ParseGraph {
        parser::Parser::new(source, name).parse()
    }

    /// Parse and compile SAU source into a program.
    pub fn compile(source: &str, name: &str) -> Result<Program, CompileError> {
        let graph = Self::parse(source, name);
        let script = lower::lower(graph)?;
        build_program(&script)
    }
}
