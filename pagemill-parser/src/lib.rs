//! Parser for Batchfiles: declarative lists of command stages.

mod grammar;
mod parser;

pub use parser::parse_batchfile;
