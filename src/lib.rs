//! Reference-consistent model of compiled JVM classes.
//!
//! A [`program::Program`] holds every scanned class, field and method in id-addressed arenas
//! together with the Reference Index that maps qualified names to ids. Scanning fills it in
//! phases (decode, link hierarchy, resolve references, build control flow graphs), passes then
//! rename, move and delete entities through [`mutate`], and output passes encode the result.

pub mod analyzer;
pub mod bytecode;
pub mod cfg;
pub mod decode;
pub mod descriptor;
pub mod encode;
pub mod error;
pub mod hierarchy;
pub mod index;
pub mod ir;
pub mod loader;
pub mod model;
pub mod mutate;
pub mod opcodes;
pub mod output;
pub mod passes;
pub mod program;
pub mod report;
pub mod resolve;
pub mod scan;
pub mod settings;
pub mod stream;

#[cfg(test)]
mod fixtures;
