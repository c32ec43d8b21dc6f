mod schema;

pub use schema::*;

/// Render a schema value as pretty JSON for command line output.
pub fn to_pretty_json<T: serde::Serialize>(value: &T) -> serde_json::Result<String> {
    serde_json::to_string_pretty(value)
}
