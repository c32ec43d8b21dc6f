mod logger;
mod mmdb;

pub use logger::*;
pub use mmdb::*;
