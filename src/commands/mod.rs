pub mod check;
pub mod replay;
pub mod run;

// Re-export command functions for convenience
pub use check::check_config;
pub use replay::replay;
pub use run::run;

use anyhow::Result;
use std::path::Path;

use feedpull::config::Config;

/// Config from `path`, or from the environment when no file is given
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::from_file(path),
        None => Config::from_env(),
    }
}
