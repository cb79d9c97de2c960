pub mod config;
pub mod filter;
pub mod io;
pub mod measurement;
pub mod system;
pub mod tracking;
