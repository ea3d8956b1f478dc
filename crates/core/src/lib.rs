pub mod config;
pub mod error;
pub mod progress;
pub mod work_item;

pub use config::Config;
pub use error::*;
pub use progress::*;
pub use work_item::*;
