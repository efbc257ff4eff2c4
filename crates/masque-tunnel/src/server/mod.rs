mod demux;
mod shared_tun;

pub use demux::*;
pub use shared_tun::*;
