pub mod serve;
pub mod sessions;
pub mod stats;
pub mod token;
