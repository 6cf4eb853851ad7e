pub mod book;
pub mod field;

pub use book::*;
pub use field::*;
