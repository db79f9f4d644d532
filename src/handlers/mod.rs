pub mod config;
pub mod consult;
