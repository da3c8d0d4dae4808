//! Configuration issues reported while an office is loaded.
//!
//! Issues are never escalations: they are collected through an [`IssueSink`]
//! and prevent the office from opening.

use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// Kind of configuration element an issue is reported against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AssetType {
    Office,
    Function,
    ManagedObject,
    Team,
    Governance,
    Escalation,
}

impl fmt::Display for AssetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AssetType::Office => "office",
            AssetType::Function => "function",
            AssetType::ManagedObject => "managed object",
            AssetType::Team => "team",
            AssetType::Governance => "governance",
            AssetType::Escalation => "escalation",
        };
        f.write_str(name)
    }
}

/// A single problem found in an office descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationIssue {
    pub office: String,
    pub asset_type: AssetType,
    pub asset_name: String,
    pub message: String,
}

impl fmt::Display for ConfigurationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "office {} {} {}: {}",
            self.office, self.asset_type, self.asset_name, self.message
        )
    }
}

/// Receives configuration issues as they are found.
pub trait IssueSink: Send + Sync {
    fn add_issue(&self, issue: ConfigurationIssue);
}

/// Issue sink that keeps every issue for later inspection.
#[derive(Debug, Default)]
pub struct CollectedIssues {
    issues: Mutex<Vec<ConfigurationIssue>>,
}

impl CollectedIssues {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether no issue has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.issues.lock().map_or(true, |issues| issues.is_empty())
    }

    /// Returns a copy of the recorded issues.
    #[must_use]
    pub fn issues(&self) -> Vec<ConfigurationIssue> {
        self.issues
            .lock()
            .map(|issues| issues.clone())
            .unwrap_or_default()
    }
}

impl IssueSink for CollectedIssues {
    fn add_issue(&self, issue: ConfigurationIssue) {
        tracing::error!(
            office = %issue.office,
            asset_type = %issue.asset_type,
            asset = %issue.asset_name,
            "{}",
            issue.message
        );
        if let Ok(mut issues) = self.issues.lock() {
            issues.push(issue);
        }
    }
}
