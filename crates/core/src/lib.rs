pub mod config;
pub mod error;
pub mod hours;
pub mod job;
pub mod meter;
pub mod reading;

pub use config::Config;
pub use error::*;
pub use job::*;
pub use meter::*;
pub use reading::*;
