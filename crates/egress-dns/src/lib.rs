pub mod forwarder;
pub mod upstream;

pub use forwarder::*;
pub use upstream::*;
