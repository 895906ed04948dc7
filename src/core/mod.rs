//! Manifest language core: lexing, parsing, evaluation and catalog
//! compilation.

pub mod ast;
pub mod catalog;
pub mod collector;
pub mod compiler;
pub mod error;
pub mod evaluator;
pub mod functions;
pub mod lexer;
pub mod parser;
pub mod registry;
pub mod resource;
pub mod scope;
pub mod settings;
pub mod types;
