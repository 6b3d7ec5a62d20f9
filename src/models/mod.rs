pub mod detection;
pub mod file;
pub mod job;
