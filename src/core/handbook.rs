//! Company Handbook: declarative policy for priority and approval.
//!
//! The policy lives in the YAML header block of `Company_Handbook.md`; the body
//! is free Markdown for the agent and the human. The file is re-read on every
//! orchestrator cycle so edits take effect without a restart.
//!
//! ```yaml
//! ---
//! default_priority: normal
//! priority_keywords:
//!   high: [urgent, asap, invoice, payment]
//!   low: [newsletter]
//! approval_rules:
//!   - action: payment
//!     above_amount: 500
//!   - action: email_send
//!     new_contact: true
//! ---
//! ```

use std::collections::BTreeMap;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::debug;

use crate::config::paths;
use crate::domain::item::split_document;
use crate::domain::{ItemHeader, ItemParseError, Priority};

/// Errors that can occur loading the Handbook
#[derive(Debug, Error)]
pub enum HandbookError {
    #[error("Failed to read handbook: {0}")]
    Io(#[from] io::Error),

    #[error("Handbook header is not terminated: {0}")]
    Malformed(#[from] ItemParseError),

    #[error("Handbook policy is invalid: {0}")]
    Invalid(#[from] serde_yaml::Error),
}

/// One approval requirement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRule {
    /// Action this rule covers (`payment`, `email_send`, ...) or `*`
    pub action: String,

    /// Require approval when the request's amount exceeds this
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub above_amount: Option<f64>,

    /// Require approval when the counterpart is a new contact
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub new_contact: bool,

    /// Require approval unconditionally
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub always: bool,
}

impl ApprovalRule {
    fn covers(&self, action: &str) -> bool {
        self.action == "*" || self.action.eq_ignore_ascii_case(action)
    }

    /// Reason approval is needed, if this rule applies to the header
    fn evaluate(&self, action: &str, header: &ItemHeader) -> Option<String> {
        if !self.covers(action) {
            return None;
        }

        let unconditional = self.always || (self.above_amount.is_none() && !self.new_contact);
        if unconditional {
            return Some(format!("{} always requires approval", action));
        }

        if let (Some(limit), Some(amount)) = (self.above_amount, header.amount()) {
            if amount > limit {
                return Some(format!("{} of {:.2} exceeds {:.2}", action, amount, limit));
            }
        }

        if self.new_contact && header.is_new_contact() {
            return Some(format!("{} to a new contact", action));
        }

        None
    }
}

/// Parsed Handbook policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handbook {
    #[serde(default)]
    pub default_priority: Priority,

    /// Priority → keywords that raise (or lower) an item to it
    #[serde(default)]
    pub priority_keywords: BTreeMap<Priority, Vec<String>>,

    #[serde(default)]
    pub approval_rules: Vec<ApprovalRule>,
}

impl Default for Handbook {
    fn default() -> Self {
        let mut priority_keywords = BTreeMap::new();
        priority_keywords.insert(
            Priority::High,
            ["urgent", "asap", "invoice", "payment"]
                .iter()
                .map(|k| k.to_string())
                .collect(),
        );

        Self {
            default_priority: Priority::Normal,
            priority_keywords,
            approval_rules: vec![ApprovalRule {
                action: "payment".to_string(),
                above_amount: Some(500.0),
                new_contact: false,
                always: false,
            }],
        }
    }
}

impl Handbook {
    /// Load the Handbook of a vault, falling back to defaults when absent
    pub async fn load(root: &Path) -> Result<Self, HandbookError> {
        let path = paths::handbook(root);

        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No handbook, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };

        Self::parse(&text)
    }

    /// Parse Handbook text. A handbook without a header block is prose only.
    pub fn parse(text: &str) -> Result<Self, HandbookError> {
        let yaml = match split_document(text) {
            Ok((yaml, _)) => yaml,
            Err(ItemParseError::MissingHeader) => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };

        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }

        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Priority for a piece of text: the highest priority whose keyword appears
    pub fn priority_for(&self, text: &str) -> Priority {
        let haystack = text.to_lowercase();

        // BTreeMap iterates Low..High; take the highest match
        self.priority_keywords
            .iter()
            .rev()
            .find(|(_, keywords)| keywords.iter().any(|k| contains_keyword(&haystack, k)))
            .map(|(priority, _)| *priority)
            .unwrap_or(self.default_priority)
    }

    /// Keywords found in the text, for the item's `tags`
    pub fn tags_for(&self, text: &str) -> Vec<String> {
        let haystack = text.to_lowercase();
        let mut tags: Vec<String> = self
            .priority_keywords
            .values()
            .flatten()
            .filter(|k| contains_keyword(&haystack, k))
            .map(|k| k.to_lowercase())
            .collect();

        tags.sort();
        tags.dedup();
        tags
    }

    /// Why an item needs human approval, or `None` if it does not
    pub fn approval_required(&self, header: &ItemHeader) -> Option<String> {
        let action = header.action()?;
        self.approval_rules
            .iter()
            .find_map(|rule| rule.evaluate(&action, header))
    }

    /// The Handbook written by `vaultflow init`
    pub fn default_document() -> Result<String, HandbookError> {
        let yaml = serde_yaml::to_string(&Self::default())?;
        Ok(format!(
            "---\n{yaml}---\n\
             # Company Handbook\n\n\
             ## Rules of Engagement\n\n\
             - Be polite and professional in every message.\n\
             - Flag any payment over $500 for approval.\n\
             - Never send money or messages to a new contact without approval.\n\
             - When a task is finished, print TASK_COMPLETE.\n"
        ))
    }
}

/// Case-insensitive whole-word match (haystack already lowercased)
fn contains_keyword(haystack: &str, keyword: &str) -> bool {
    let keyword = keyword.trim().to_lowercase();
    if keyword.is_empty() {
        return false;
    }

    haystack.match_indices(&keyword).any(|(start, _)| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + keyword.len()..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn payment(amount: f64) -> ItemHeader {
        ItemHeader::new("approval_request", Utc::now(), Priority::High)
            .with_field("action", "payment")
            .with_field("amount", amount)
    }

    #[test]
    fn test_default_payment_threshold() {
        let handbook = Handbook::default();

        assert!(handbook.approval_required(&payment(600.0)).is_some());
        assert!(handbook.approval_required(&payment(500.0)).is_none());
        assert!(handbook.approval_required(&payment(120.0)).is_none());
    }

    #[test]
    fn test_no_action_no_approval() {
        let handbook = Handbook::default();
        let header = ItemHeader::new("file_drop", Utc::now(), Priority::Normal);
        assert!(handbook.approval_required(&header).is_none());
    }

    #[test]
    fn test_priority_keywords() {
        let handbook = Handbook::default();

        assert_eq!(handbook.priority_for("URGENT: server down"), Priority::High);
        assert_eq!(handbook.priority_for("Invoice_March.pdf"), Priority::High);
        assert_eq!(handbook.priority_for("lunch plans"), Priority::Normal);
        // Whole words only
        assert_eq!(handbook.priority_for("repayments.csv"), Priority::Normal);
        assert_eq!(handbook.tags_for("urgent invoice"), vec!["invoice", "urgent"]);
    }

    #[test]
    fn test_parse_custom_rules() {
        let text = r#"---
default_priority: low
priority_keywords:
  high: [client]
approval_rules:
  - action: email_send
    new_contact: true
  - action: social_post
---
# Handbook
"#;
        let handbook = Handbook::parse(text).unwrap();
        assert_eq!(handbook.default_priority, Priority::Low);
        assert_eq!(handbook.priority_for("client call"), Priority::High);

        let known = ItemHeader::new("approval_request", Utc::now(), Priority::Normal)
            .with_field("action", "email_send");
        assert!(handbook.approval_required(&known).is_none());
        assert!(handbook
            .approval_required(&known.clone().with_field("new_contact", true))
            .is_some());

        let post = ItemHeader::new("approval_request", Utc::now(), Priority::Normal)
            .with_field("action", "Social_Post");
        assert!(handbook.approval_required(&post).is_some());
    }

    #[test]
    fn test_prose_only_handbook_uses_defaults() {
        let handbook = Handbook::parse("# Be nice\n").unwrap();
        assert_eq!(handbook, Handbook::default());
    }

    #[test]
    fn test_invalid_policy() {
        let result = Handbook::parse("---\napproval_rules: 12\n---\n");
        assert!(matches!(result, Err(HandbookError::Invalid(_))));
    }

    #[test]
    fn test_default_document_round_trips() {
        let text = Handbook::default_document().unwrap();
        assert_eq!(Handbook::parse(&text).unwrap(), Handbook::default());
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let temp = TempDir::new().unwrap();
        let handbook = Handbook::load(temp.path()).await.unwrap();
        assert_eq!(handbook, Handbook::default());
    }
}
