//! Shared data structures

pub mod int_set;

pub use int_set::IntSet;
