use crate::config::FileError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Runtime choices that survive a restart.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RawState {
    #[serde(default)]
    pub group_selection: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct LinkedState {
    pub state_path: PathBuf,
    pub state: RawState,
}

impl LinkedState {
    /// A missing file is an empty state.
    pub fn load(state_path: &Path) -> Result<Self, FileError> {
        let state = match std::fs::read_to_string(state_path) {
            Ok(content) => serde_yaml::from_str(&content).map_err(|e| {
                FileError::Serde(state_path.to_string_lossy().to_string(), e)
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => RawState::default(),
            Err(e) => return Err(FileError::Io(state_path.to_string_lossy().to_string(), e)),
        };
        Ok(Self {
            state_path: state_path.to_path_buf(),
            state,
        })
    }

    pub fn set_selection(&mut self, group: &str, member: &str) {
        if let Some(val) = self.state.group_selection.get_mut(group) {
            *val = member.to_string();
        } else {
            self.state
                .group_selection
                .insert(group.to_string(), member.to_string());
        }
    }

    pub fn flush(&self) -> Result<(), FileError> {
        let path = self.state_path.to_string_lossy().to_string();
        let content =
            serde_yaml::to_string(&self.state).map_err(|e| FileError::Serde(path.clone(), e))?;
        let content = "# This file is managed by policyroute. Do not edit unless you know what you are doing.\n"
            .to_string()
            + content.as_str();
        fn inner(path: &Path, contents: &[u8]) -> std::io::Result<()> {
            let mut file = std::fs::File::create(path)?;
            file.write_all(contents)?;
            file.flush()
        }
        inner(&self.state_path, content.as_bytes()).map_err(|e| FileError::Io(path, e))
    }
}
