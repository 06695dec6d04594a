//! Rate-limited resource categories

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A category of rate-limited action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Any general authenticated API call
    ApiCall,
    /// One AI-generated stock analysis
    AiAnalysis,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 2] = [ResourceKind::ApiCall, ResourceKind::AiAnalysis];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::ApiCall => "api_call",
            ResourceKind::AiAnalysis => "ai_analysis",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown resource kind: {0}")]
pub struct ParseResourceKindError(pub String);

impl FromStr for ResourceKind {
    type Err = ParseResourceKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "api_call" => Ok(ResourceKind::ApiCall),
            "ai_analysis" => Ok(ResourceKind::AiAnalysis),
            other => Err(ParseResourceKindError(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_kinds() {
        assert_eq!("api_call".parse::<ResourceKind>().unwrap(), ResourceKind::ApiCall);
        assert_eq!(
            "ai_analysis".parse::<ResourceKind>().unwrap(),
            ResourceKind::AiAnalysis
        );
    }

    #[test]
    fn test_parse_unknown_kind() {
        let err = "tokens".parse::<ResourceKind>().unwrap_err();
        assert_eq!(err.to_string(), "unknown resource kind: tokens");
    }

    #[test]
    fn test_serde_matches_display() {
        for kind in ResourceKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind));
        }
    }
}
