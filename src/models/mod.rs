pub mod api;
pub mod detection;
pub mod error;
pub mod job;
pub mod load;
