use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use scraper::{ElementRef, Selector};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::page::{Page, PageSource};

static ANY_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("*").unwrap());
static SIGNIFICANT_SEL: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("table, tbody, .slds-table, .record-detail, .kanban-board").unwrap()
});

const MUTATION_CHANNEL_CAPACITY: usize = 256;
const CHANGE_CHANNEL_CAPACITY: usize = 16;

/// Element structure of a page: tag and classes of every element, plus the
/// same for everything inside the regions that hold records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Signature {
    structure: Vec<String>,
    significant: Vec<String>,
}

fn describe(el: ElementRef<'_>) -> String {
    let v = el.value();
    let classes: Vec<&str> = v.classes().collect();
    format!("{}.{}", v.name(), classes.join("."))
}

pub fn signature(page: &Page) -> Signature {
    let structure = page.html().select(&ANY_SEL).map(describe).collect();
    let significant = page
        .html()
        .select(&SIGNIFICANT_SEL)
        .flat_map(|region| region.descendants().filter_map(ElementRef::wrap))
        .map(describe)
        .collect();
    Signature {
        structure,
        significant,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mutation {
    /// Touched a table, table body, record detail or kanban board.
    pub significant: bool,
}

impl Signature {
    pub fn diff(&self, next: &Signature) -> Option<Mutation> {
        if self.significant != next.significant {
            Some(Mutation { significant: true })
        } else if self.structure != next.structure {
            Some(Mutation { significant: false })
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentChanged {
    pub at: i64,
}

/// Debounces raw mutations into `ContentChanged` signals. A signal fires once
/// the stream has been quiet for `delay` and at least one mutation in the
/// burst was significant.
pub struct ChangeMonitor {
    mutations: mpsc::Sender<Mutation>,
    changes: broadcast::Sender<ContentChanged>,
    task: JoinHandle<()>,
}

impl ChangeMonitor {
    pub fn start(delay: Duration) -> Self {
        let (mutations, rx) = mpsc::channel(MUTATION_CHANNEL_CAPACITY);
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let task = tokio::spawn(debounce(rx, changes.clone(), delay));
        Self {
            mutations,
            changes,
            task,
        }
    }

    pub fn sender(&self) -> mpsc::Sender<Mutation> {
        self.mutations.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ContentChanged> {
        self.changes.subscribe()
    }

    pub fn stop(self) {
        self.task.abort();
    }
}

async fn debounce(
    mut rx: mpsc::Receiver<Mutation>,
    changes: broadcast::Sender<ContentChanged>,
    delay: Duration,
) {
    while let Some(first) = rx.recv().await {
        let mut significant = first.significant;
        loop {
            tokio::select! {
                next = rx.recv() => match next {
                    Some(m) => significant |= m.significant,
                    None => break,
                },
                _ = tokio::time::sleep(delay) => break,
            }
        }
        if significant {
            info!("Significant page change detected");
            let _ = changes.send(ContentChanged {
                at: Utc::now().timestamp_millis(),
            });
        } else {
            debug!("Ignoring insignificant page change");
        }
    }
}

fn source_signature(source: &dyn PageSource) -> Result<Signature> {
    Ok(signature(&source.snapshot()?))
}

/// Re-read `source` every `interval` and feed structural differences into
/// `mutations`. Ends when the receiving side goes away.
pub async fn poll_source(
    source: Arc<dyn PageSource>,
    mutations: mpsc::Sender<Mutation>,
    interval: Duration,
) {
    let mut last = match source_signature(source.as_ref()) {
        Ok(sig) => sig,
        Err(e) => {
            warn!("Cannot read {}: {e:#}", source.describe());
            Signature::default()
        }
    };
    loop {
        tokio::time::sleep(interval).await;
        let next = match source_signature(source.as_ref()) {
            Ok(sig) => sig,
            Err(e) => {
                debug!("Cannot read {}: {e:#}", source.describe());
                continue;
            }
        };
        if let Some(m) = last.diff(&next) {
            if mutations.send(m).await.is_err() {
                return;
            }
        }
        last = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::FileSource;

    fn sig(body: &str) -> Signature {
        signature(&Page::parse("", body))
    }

    #[test]
    fn table_changes_are_significant() {
        let before = sig(r#"<div class="header"></div><table><tbody><tr><td>A</td></tr></tbody></table>"#);
        let after = sig(
            r#"<div class="header"></div><table><tbody><tr><td>A</td></tr><tr><td>B</td></tr></tbody></table>"#,
        );
        assert_eq!(before.diff(&after), Some(Mutation { significant: true }));
    }

    #[test]
    fn changes_elsewhere_are_not() {
        let before = sig(r#"<div class="toast"></div><table><tbody><tr><td>A</td></tr></tbody></table>"#);
        let after = sig(
            r#"<div class="toast"><span class="message"></span></div><table><tbody><tr><td>A</td></tr></tbody></table>"#,
        );
        assert_eq!(before.diff(&after), Some(Mutation { significant: false }));
    }

    #[test]
    fn text_only_changes_are_ignored() {
        let before = sig("<table><tbody><tr><td>A</td></tr></tbody></table>");
        let after = sig("<table><tbody><tr><td>B</td></tr></tbody></table>");
        assert_eq!(before.diff(&after), None);
    }

    #[tokio::test]
    async fn burst_yields_one_signal() {
        let monitor = ChangeMonitor::start(Duration::from_millis(30));
        let mut changes = monitor.subscribe();
        let tx = monitor.sender();
        tx.send(Mutation { significant: false }).await.unwrap();
        tx.send(Mutation { significant: true }).await.unwrap();
        tx.send(Mutation { significant: false }).await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(2), changes.recv()).await;
        assert!(first.unwrap().is_ok());
        let second = tokio::time::timeout(Duration::from_millis(100), changes.recv()).await;
        assert!(second.is_err());
        monitor.stop();
    }

    #[tokio::test]
    async fn insignificant_burst_is_silent() {
        let monitor = ChangeMonitor::start(Duration::from_millis(10));
        let mut changes = monitor.subscribe();
        let tx = monitor.sender();
        for _ in 0..3 {
            tx.send(Mutation { significant: false }).await.unwrap();
        }
        let got = tokio::time::timeout(Duration::from_millis(100), changes.recv()).await;
        assert!(got.is_err());
        monitor.stop();
    }

    #[tokio::test]
    async fn polling_picks_up_file_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.html");
        std::fs::write(&path, "<table><tbody><tr><td>A</td></tr></tbody></table>").unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let source: Arc<dyn PageSource> = Arc::new(FileSource::new(&path, ""));
        let poller = tokio::spawn(poll_source(source, tx, Duration::from_millis(5)));

        tokio::time::sleep(Duration::from_millis(20)).await;
        std::fs::write(
            &path,
            "<table><tbody><tr><td>A</td></tr><tr><td>B</td></tr></tbody></table>",
        )
        .unwrap();

        let m = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(m.significant);
        poller.abort();
    }
}
