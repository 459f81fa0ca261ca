pub mod catalog;
pub mod chunks;

pub use catalog::*;
pub use chunks::*;
