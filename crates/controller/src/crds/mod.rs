pub mod namespaceclass;

pub use namespaceclass::*;
