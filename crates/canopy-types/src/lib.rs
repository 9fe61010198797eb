pub mod domain;
pub mod errors;

pub use domain::*;
pub use errors::*;
