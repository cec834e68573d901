//! Device protocol implementations.

pub mod dlp6500;
pub mod pe4000;
