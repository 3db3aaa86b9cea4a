// Index expression language: parsing and evaluation.

pub mod parser;

pub use parser::{parse, parse_all, Getter};
