//! Canonical paths inside a vault.
//!
//! Single source of truth - import this instead of hardcoding folder names.
//!
//! ## Layout
//!
//! | Location | Owner | Purpose |
//! |----------|-------|---------|
//! | `Inbox/`, `Needs_Action/`, ... | Item store | One folder per `ItemState` |
//! | `Logs/` | Audit log | Daily `YYYY-MM-DD.jsonl` files |
//! | `Plans/` | Agent | Multi-step plans (not item states) |
//! | `Alerts/` | Orchestrator | Human-visible failure alerts |
//! | `.vaultflow/` | vaultflow | Config, claims, message exports |

use std::path::{Path, PathBuf};

use super::SourceKind;

/// Audit log folder
pub const LOGS_DIR: &str = "Logs";

/// Agent-authored plans
pub const PLANS_DIR: &str = "Plans";

/// Alert items for humans
pub const ALERTS_DIR: &str = "Alerts";

/// Policy document
pub const HANDBOOK_FILE: &str = "Company_Handbook.md";

/// Activity summary for humans
pub const DASHBOARD_FILE: &str = "Dashboard.md";

/// Engine state directory inside the vault
pub const ENGINE_DIR: &str = ".vaultflow";

/// Auxiliary folders that are not item states
pub const AUXILIARY_DIRS: [&str; 3] = [LOGS_DIR, PLANS_DIR, ALERTS_DIR];

pub fn logs_dir(root: &Path) -> PathBuf {
    root.join(LOGS_DIR)
}

pub fn plans_dir(root: &Path) -> PathBuf {
    root.join(PLANS_DIR)
}

pub fn alerts_dir(root: &Path) -> PathBuf {
    root.join(ALERTS_DIR)
}

pub fn handbook(root: &Path) -> PathBuf {
    root.join(HANDBOOK_FILE)
}

pub fn dashboard(root: &Path) -> PathBuf {
    root.join(DASHBOARD_FILE)
}

/// `.vaultflow/config.yaml`
pub fn config_file(root: &Path) -> PathBuf {
    root.join(ENGINE_DIR).join("config.yaml")
}

/// `.vaultflow/claims/` - one lock file per item being processed
pub fn claims_dir(root: &Path) -> PathBuf {
    root.join(ENGINE_DIR).join("claims")
}

/// `.vaultflow/sources/<email|chat>/` - default location for message exports
pub fn messages_dir(root: &Path, source: SourceKind) -> PathBuf {
    let name = match source {
        SourceKind::Filesystem => "files",
        SourceKind::Email => "email",
        SourceKind::Chat => "chat",
    };
    root.join(ENGINE_DIR).join("sources").join(name)
}
