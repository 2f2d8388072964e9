use serde::Serialize;

/// Broad category of a spawned agent, inferred from its display name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentCategory {
    Reviewer,
    Tester,
    Debugger,
    Architect,
    Researcher,
    DocWriter,
    Implementer,
    Orchestrator,
    General,
}

impl AgentCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reviewer => "reviewer",
            Self::Tester => "tester",
            Self::Debugger => "debugger",
            Self::Architect => "architect",
            Self::Researcher => "researcher",
            Self::DocWriter => "doc_writer",
            Self::Implementer => "implementer",
            Self::Orchestrator => "orchestrator",
            Self::General => "general",
        }
    }
}

/// Ordered classification rules: first matching substring wins, so more
/// specific patterns must come before broader ones.
const RULES: &[(&str, AgentCategory)] = &[
    ("orchestrat", AgentCategory::Orchestrator),
    ("wave", AgentCategory::Orchestrator),
    ("review", AgentCategory::Reviewer),
    ("lint", AgentCategory::Reviewer),
    ("test", AgentCategory::Tester),
    ("qa", AgentCategory::Tester),
    ("debug", AgentCategory::Debugger),
    ("fix", AgentCategory::Debugger),
    ("architect", AgentCategory::Architect),
    ("design", AgentCategory::Architect),
    ("research", AgentCategory::Researcher),
    ("search", AgentCategory::Researcher),
    ("explore", AgentCategory::Researcher),
    ("doc", AgentCategory::DocWriter),
    ("writer", AgentCategory::DocWriter),
    ("implement", AgentCategory::Implementer),
    ("build", AgentCategory::Implementer),
    ("coder", AgentCategory::Implementer),
    ("engineer", AgentCategory::Implementer),
];

pub fn classify(agent_name: &str) -> AgentCategory {
    let name = agent_name.to_lowercase();
    RULES
        .iter()
        .find(|(pattern, _)| name.contains(pattern))
        .map(|(_, category)| *category)
        .unwrap_or(AgentCategory::General)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_common_agent_names() {
        assert_eq!(classify("code-reviewer"), AgentCategory::Reviewer);
        assert_eq!(classify("Test Runner"), AgentCategory::Tester);
        assert_eq!(classify("debugger-2"), AgentCategory::Debugger);
        assert_eq!(classify("api-designer"), AgentCategory::Architect);
        assert_eq!(classify("web-searcher"), AgentCategory::Researcher);
        assert_eq!(classify("doc-generator"), AgentCategory::DocWriter);
        assert_eq!(classify("feature-builder"), AgentCategory::Implementer);
        assert_eq!(classify("wave-orchestrator"), AgentCategory::Orchestrator);
    }

    #[test]
    fn first_rule_wins() {
        // Contains both "wave" and "review"; the earlier rule applies.
        assert_eq!(classify("wave-reviewer"), AgentCategory::Orchestrator);
    }

    #[test]
    fn unknown_names_fall_through() {
        assert_eq!(classify("subagent"), AgentCategory::General);
        assert_eq!(classify(""), AgentCategory::General);
    }

    #[test]
    fn classification_is_case_insensitive() {
        assert_eq!(classify("REVIEWER"), AgentCategory::Reviewer);
    }
}
