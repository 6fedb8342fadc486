pub mod conversations;

pub use conversations::*;
