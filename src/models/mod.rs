pub mod claims;
pub mod file;

pub use claims::*;
pub use file::*;
