pub mod admission;
pub mod runner;
pub mod transcoder;
