pub mod config;
pub mod listings;
pub mod logging;
pub mod realtime;
pub mod repositories;
