pub mod job;
pub mod model;
pub mod repository;
pub mod transcode;
