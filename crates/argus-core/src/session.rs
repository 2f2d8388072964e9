use serde::{Deserialize, Serialize};

/// Session lifecycle status. Transitions are monotonic: once a session
/// reaches a terminal state it never reverts to `active`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    Main,
    Subagent,
    Wave,
    Continuation,
    Isolated,
}

impl std::fmt::Display for SessionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Main => "main",
            Self::Subagent => "subagent",
            Self::Wave => "wave",
            Self::Continuation => "continuation",
            Self::Isolated => "isolated",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for SessionType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "main" => Ok(Self::Main),
            "subagent" => Ok(Self::Subagent),
            "wave" => Ok(Self::Wave),
            "continuation" => Ok(Self::Continuation),
            "isolated" => Ok(Self::Isolated),
            other => Err(format!("unknown session type: {other}")),
        }
    }
}

/// How a child session relates to its parent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipType {
    ParentChild,
    Sibling,
    Continuation,
    WaveMember,
}

impl std::fmt::Display for RelationshipType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ParentChild => "parent_child",
            Self::Sibling => "sibling",
            Self::Continuation => "continuation",
            Self::WaveMember => "wave_member",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for RelationshipType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "parent_child" => Ok(Self::ParentChild),
            "sibling" => Ok(Self::Sibling),
            "continuation" => Ok(Self::Continuation),
            "wave_member" => Ok(Self::WaveMember),
            other => Err(format!("unknown relationship type: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpawnReason {
    SubagentDelegation,
    WaveOrchestration,
    TaskTool,
    Continuation,
    Manual,
}

impl std::fmt::Display for SpawnReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::SubagentDelegation => "subagent_delegation",
            Self::WaveOrchestration => "wave_orchestration",
            Self::TaskTool => "task_tool",
            Self::Continuation => "continuation",
            Self::Manual => "manual",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for SpawnReason {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "subagent_delegation" => Ok(Self::SubagentDelegation),
            "wave_orchestration" => Ok(Self::WaveOrchestration),
            "task_tool" => Ok(Self::TaskTool),
            "continuation" => Ok(Self::Continuation),
            "manual" => Ok(Self::Manual),
            other => Err(format!("unknown spawn reason: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegationType {
    Parallel,
    Sequential,
    Isolated,
}

impl std::fmt::Display for DelegationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Parallel => "parallel",
            Self::Sequential => "sequential",
            Self::Isolated => "isolated",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for DelegationType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "parallel" => Ok(Self::Parallel),
            "sequential" => Ok(Self::Sequential),
            "isolated" => Ok(Self::Isolated),
            other => Err(format!("unknown delegation type: {other}")),
        }
    }
}
