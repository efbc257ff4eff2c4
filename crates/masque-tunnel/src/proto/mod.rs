mod capsule;
mod error;

pub use capsule::*;
pub use error::*;
