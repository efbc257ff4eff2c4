mod h3socket;
mod layered;
mod wiring;

pub use h3socket::*;
pub use layered::*;
pub use wiring::*;
