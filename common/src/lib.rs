pub mod cache;
pub mod camera;
pub mod config;
pub mod frame;
