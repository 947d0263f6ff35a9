//! Fault-isolated polling loop for a watcher.

use std::time::Duration;

use tracing::{error, info, warn};

use super::{Watcher, WatcherError};
use crate::core::shutdown::ShutdownSignal;

/// Outcome of a single tick
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub created: Vec<String>,
    pub failed: usize,
}

/// Run one check: observe the source, then write every new item
///
/// A failure on one item does not stop the others. A failure to check the
/// source at all is returned to the caller.
pub async fn run_once<W>(watcher: &mut W) -> Result<TickReport, WatcherError>
where
    W: Watcher + ?Sized,
{
    let mut report = TickReport::default();

    for item in watcher.check_for_updates().await? {
        let id = item.id.clone();
        match watcher.create_action_file(item).await {
            Ok(created) => report.created.push(created.id),
            Err(e) => {
                warn!(watcher = watcher.name(), item_id = %id, error = %e, "Failed to create action file");
                report.failed += 1;
            }
        }
    }

    Ok(report)
}

/// Poll `watcher` every `interval` until shutdown
///
/// Errors are logged and the loop keeps going: the next tick may well succeed.
pub async fn run<W>(watcher: &mut W, interval: Duration, mut shutdown: ShutdownSignal)
where
    W: Watcher + ?Sized,
{
    info!(watcher = watcher.name(), interval_secs = interval.as_secs(), "Watcher started");

    loop {
        if shutdown.is_triggered() {
            break;
        }

        match run_once(watcher).await {
            Ok(report) if !report.created.is_empty() => {
                info!(watcher = watcher.name(), created = report.created.len(), "New items written");
            }
            Ok(_) => {}
            Err(e) if e.is_structural() => {
                error!(watcher = watcher.name(), error = %e, "Watcher source unavailable");
            }
            Err(e) => {
                warn!(watcher = watcher.name(), error = %e, "Watcher check failed");
            }
        }

        if watcher.wait(interval, &mut shutdown).await {
            break;
        }
    }

    info!(watcher = watcher.name(), "Watcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::shutdown;
    use crate::domain::{Item, ItemHeader, ItemState, Priority};
    use crate::ingest::SourceItem;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    /// Watcher that fails on chosen ticks and items
    struct ScriptedWatcher {
        ticks: usize,
        fail_checks_on: Vec<usize>,
        fail_items: Vec<String>,
        written: Vec<String>,
    }

    impl ScriptedWatcher {
        fn new() -> Self {
            Self {
                ticks: 0,
                fail_checks_on: Vec::new(),
                fail_items: Vec::new(),
                written: Vec::new(),
            }
        }
    }

    fn source_item(id: &str) -> SourceItem {
        SourceItem {
            key: id.to_string(),
            id: id.to_string(),
            kind: "test".to_string(),
            created: Utc::now(),
            body: String::new(),
            keyword_text: String::new(),
            fields: BTreeMap::new(),
            payload: None,
        }
    }

    #[async_trait]
    impl Watcher for ScriptedWatcher {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn check_for_updates(&mut self) -> Result<Vec<SourceItem>, WatcherError> {
            self.ticks += 1;
            if self.fail_checks_on.contains(&self.ticks) {
                return Err(WatcherError::SourceNotFound(PathBuf::from("/missing")));
            }
            Ok(vec![
                source_item(&format!("A_{}", self.ticks)),
                source_item(&format!("B_{}", self.ticks)),
            ])
        }

        async fn create_action_file(&mut self, item: SourceItem) -> Result<Item, WatcherError> {
            if self.fail_items.contains(&item.id) {
                return Err(WatcherError::Io(std::io::Error::other("disk full")));
            }
            self.written.push(item.id.clone());
            Ok(Item {
                id: item.id,
                state: ItemState::NeedsAction,
                header: ItemHeader::new("test", item.created, Priority::Normal),
                body: item.body,
                path: PathBuf::new(),
            })
        }
    }

    #[tokio::test]
    async fn test_run_once_isolates_item_failures() {
        let mut watcher = ScriptedWatcher::new();
        watcher.fail_items.push("A_1".to_string());

        let report = run_once(&mut watcher).await.unwrap();
        assert_eq!(report.created, vec!["B_1".to_string()]);
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn test_run_survives_failed_ticks() {
        let mut watcher = ScriptedWatcher::new();
        watcher.fail_checks_on = vec![1, 2];

        let (trigger, signal) = shutdown::channel();
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.trigger();
        });

        tokio::time::timeout(
            Duration::from_secs(5),
            run(&mut watcher, Duration::from_millis(20), signal),
        )
        .await
        .unwrap();
        stopper.await.unwrap();

        assert!(watcher.ticks > 2);
        assert!(watcher.written.contains(&"A_3".to_string()));
    }

    #[tokio::test]
    async fn test_run_stops_immediately_when_already_shut_down() {
        let mut watcher = ScriptedWatcher::new();
        let (trigger, signal) = shutdown::channel();
        trigger.trigger();

        run(&mut watcher, Duration::from_secs(60), signal).await;
        assert_eq!(watcher.ticks, 0);
    }
}
