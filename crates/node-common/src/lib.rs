#![doc = "Common types shared across the sensor node workspace."]

pub mod config;
pub mod error;
pub mod nvcfg;
pub mod state;
pub mod time;

pub use config::*;
pub use error::*;
pub use nvcfg::*;
pub use state::*;
pub use time::*;
