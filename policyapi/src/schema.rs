use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct MemberSchema {
    pub name: String,
    /// `node`, `group`, `direct` or `reject`
    pub kind: String,
    pub latency: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct GroupSchema {
    pub name: String,
    /// `select` or `url-test`
    pub strategy: String,
    pub selected: Option<String>,
    pub members: Vec<MemberSchema>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DecisionSchema {
    pub target: String,
    /// Rule literal that matched, `MATCH` for the terminal entry.
    pub rule: String,
    pub rule_index: Option<usize>,
    pub group: String,
    /// Groups visited while resolving, outermost first.
    pub chain: Vec<String>,
    /// `DIRECT`, `REJECT` or the name of the dialed node.
    pub action: String,
    pub endpoint: Option<String>,
    pub fallback: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RuleSetSchema {
    pub name: String,
    pub version: u64,
    pub patterns: usize,
    pub loaded_at: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CheckReportSchema {
    pub nodes: usize,
    pub groups: usize,
    pub rules: usize,
    pub rule_sets: Vec<RuleSetSchema>,
    pub warnings: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_json_shape() {
        let d = DecisionSchema {
            target: "ads.example.com:443".to_string(),
            rule: "RULE-SET,BanAD,Reject".to_string(),
            rule_index: Some(0),
            group: "Reject".to_string(),
            chain: vec!["Reject".to_string()],
            action: "REJECT".to_string(),
            endpoint: None,
            fallback: false,
        };
        let s = serde_json::to_string(&d).unwrap();
        assert!(s.contains("\"rule_index\":0"));
        let back: DecisionSchema = serde_json::from_str(&s).unwrap();
        assert_eq!(back, d);
    }
}
