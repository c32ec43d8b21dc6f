mod checker;
mod dispatching;
mod group;
mod health;
mod proxy;
mod rule;
mod ruleset;
mod target;

pub use dispatching::*;
pub use group::*;
pub use health::{pretty_latency, HealthSample, HealthTracker, Latency, ProbeTransport};
pub use proxy::*;
pub use rule::{CountryLookup, PortRule, Rule, RuleMatch, RuleTable};
// expose this interface for refresh tasks
pub use ruleset::*;
pub use target::*;
