use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("File error: {0}")]
    File(#[from] FileError),
    #[error("Build error: {0}")]
    Build(#[from] BuildError),
    #[error("GeoIP database error: {0}")]
    GeoIp(#[from] maxminddb::MaxMindDBError),
    #[error("Runtime task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error("Internal error: {0}")]
    Internal(&'static str),
}

#[derive(Error, Debug)]
pub enum FileError {
    #[error("{0} io error: {1}")]
    Io(String, std::io::Error),
    #[error("{0} deserialization error: {1}")]
    Serde(String, serde_yaml::Error),
    #[error("{0} http error: {1}")]
    Http(String, reqwest::Error),
}

/// A rule set source that could not be indexed. Nothing of it is registered.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[error("rule set {name}: bad payload: {reason}")]
    Payload { name: String, reason: String },
    #[error("rule set {name}: malformed entry #{line} '{entry}'")]
    Malformed {
        name: String,
        line: usize,
        entry: String,
    },
    #[error("rule set {name}: keyword index: {reason}")]
    Keyword { name: String, reason: String },
}

/// Reasons a reload is rejected as a whole.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("Unknown member {member} in group {group}")]
    UnknownMember { group: String, member: String },
    #[error("Group cycle: {}", .path.join(" -> "))]
    Cycle { path: Vec<String> },
    #[error("Duplicate name: {0}")]
    DuplicateName(String),
    #[error("Reserved name used for a node or group: {0}")]
    ReservedName(String),
    #[error("Missing trailing MATCH rule")]
    MissingMatchAll,
    #[error("MATCH rule at position {0} is not the last rule")]
    MatchAllNotLast(usize),
    #[error("Invalid rule '{rule}': {reason}")]
    InvalidRule { rule: String, reason: String },
    #[error("Rule '{rule}' references unknown rule set {name}")]
    UnknownRuleSet { rule: String, name: String },
    #[error("Rule '{rule}' targets unknown group {target}")]
    UnknownTarget { rule: String, target: String },
    #[error("Invalid filter in group {group}: {reason}")]
    InvalidFilter { group: String, reason: String },
    #[error("Invalid group {group}: {reason}")]
    InvalidGroup { group: String, reason: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectError {
    #[error("Group not found: {0}")]
    UnknownGroup(String),
    #[error("{member} is not a member of group {group}")]
    UnknownMember { group: String, member: String },
    #[error("Group {0} selects automatically")]
    NotSelectable(String),
}
