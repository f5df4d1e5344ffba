pub mod common;
pub mod config;
pub mod mappings;
pub mod run;
pub mod runs;
pub mod serve;
pub mod subscription;
