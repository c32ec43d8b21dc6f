#[allow(clippy::module_inception)]
mod config;
mod error;
mod proxy_group;
mod rule_provider;
mod state;

pub use config::*;
pub use error::*;
pub use proxy_group::*;
pub use rule_provider::*;
pub use state::*;

use std::io;
use std::path::{Component, Path, PathBuf};

/// Probe target used for groups that don't declare one.
pub const DEFAULT_PROBE_URL: &str = "http://www.gstatic.com/generate_204";

/// Join a relative path onto `root`, refusing anything that could leave it.
pub fn safe_join_path(root: &Path, file_path: &str) -> io::Result<PathBuf> {
    let path = Path::new(file_path);
    if path.components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir)) {
        Ok(root.join(path))
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} escapes {}", file_path, root.to_string_lossy()),
        ))
    }
}
