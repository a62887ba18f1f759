#![allow(dead_code)]

pub mod strategies;
pub mod test_db;

pub use strategies::*;
pub use test_db::*;
