//! Model/effort vocabulary. Model *ids* are free-form strings enforced
//! against a configured prefix by the session manager; `AgentModel`
//! only distinguishes the two kinds the spark-fallback logic cares
//! about.

use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentModel {
    Standard,
    Spark,
}

impl AgentModel {
    /// Classifies a model id string. Model ids ending in `-spark` name
    /// the spark variant; anything else is standard.
    pub fn classify(model_id: &str) -> Self {
        if model_id.ends_with("-spark") {
            Self::Spark
        } else {
            Self::Standard
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningEffort {
    None,
    Minimal,
    Low,
    Medium,
    High,
    XHigh,
}

impl ReasoningEffort {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Some(Self::None),
            "minimal" => Some(Self::Minimal),
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "xhigh" => Some(Self::XHigh),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Minimal => "minimal",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::XHigh => "xhigh",
        }
    }

    /// Default effort for a freshly-selected model: `xhigh` for spark,
    /// `medium` for everything else.
    pub fn default_for(model: AgentModel) -> Self {
        match model {
            AgentModel::Spark => Self::XHigh,
            AgentModel::Standard => Self::Medium,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn classify_detects_spark_suffix() {
        assert_eq!(AgentModel::classify("gpt-5.3-codex-spark"), AgentModel::Spark);
        assert_eq!(AgentModel::classify("gpt-5.3-codex"), AgentModel::Standard);
    }

    #[test]
    fn default_effort_matches_spec() {
        assert_eq!(ReasoningEffort::default_for(AgentModel::Spark), ReasoningEffort::XHigh);
        assert_eq!(ReasoningEffort::default_for(AgentModel::Standard), ReasoningEffort::Medium);
    }

    #[test]
    fn parse_round_trips_as_str() {
        for effort in [
            ReasoningEffort::None,
            ReasoningEffort::Minimal,
            ReasoningEffort::Low,
            ReasoningEffort::Medium,
            ReasoningEffort::High,
            ReasoningEffort::XHigh,
        ] {
            assert_eq!(ReasoningEffort::parse(effort.as_str()), Some(effort));
        }
        assert_eq!(ReasoningEffort::parse("bogus"), None);
    }
}
