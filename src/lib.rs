// src/lib.rs

pub mod biometrics;
pub mod config;
pub mod detection;
pub mod geometry;
pub mod identity;
pub mod persistence;
pub mod pipeline;
pub mod ppe;
pub mod preprocessing;
pub mod quality;
pub mod source;
pub mod track_state;
pub mod types;
#[cfg(feature = "video")]
pub mod video;

pub use types::Config;
