pub mod config;
pub mod logging;
pub mod paths;

pub use config::*;
pub use logging::*;
pub use paths::{resolve_home_dir, HomeDirError};
