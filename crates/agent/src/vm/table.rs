//! VM device-table existence queries
//!
//! "Does the VM already have this device" has an authoritative answer
//! (`qom-list` on the peripheral container, matching qdev ids exactly) and
//! a fragile one (scraping the free-text `info qtree` monitor dump). The
//! scrape survives only as a fallback for hypervisors without `qom-list`,
//! and its formatting dependence is deliberately confined to this module.

use qmp::QmpClient;
use tracing::{debug, warn};

/// The QOM container holding every device added with an explicit id.
const PERIPHERAL_PATH: &str = "/machine/peripheral";

/// Monitor command whose dump the fallback scrapes.
const QTREE_COMMAND: &str = "info qtree";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableQuery {
    /// `qom-list /machine/peripheral`, matched on qdev id.
    Structured,
    /// Substring match inside the `info qtree` dump.
    QtreeScrape,
}

impl TableQuery {
    /// Pick the structured query when the hypervisor reports support for
    /// it, the text scrape otherwise.
    pub async fn detect(client: &QmpClient) -> Self {
        match client.query_commands().await {
            Ok(commands) => {
                if commands.iter().any(|c| c.name == "qom-list") {
                    debug!("device-table query: structured (qom-list)");
                    TableQuery::Structured
                } else {
                    debug!("device-table query: qtree scrape fallback");
                    TableQuery::QtreeScrape
                }
            }
            Err(err) => {
                warn!(%err, "command introspection failed, using qtree scrape");
                TableQuery::QtreeScrape
            }
        }
    }

    /// Whether the VM device table contains `synthetic_id`.
    pub async fn contains(&self, client: &QmpClient, synthetic_id: &str) -> qmp::Result<bool> {
        match self {
            TableQuery::Structured => {
                let entries = client.qom_list(PERIPHERAL_PATH).await?;
                Ok(entries.iter().any(|entry| entry.name == synthetic_id))
            }
            TableQuery::QtreeScrape => {
                let dump = client.human_monitor(QTREE_COMMAND).await?;
                Ok(qtree_contains(&dump, synthetic_id))
            }
        }
    }
}

/// The qtree dump renders a qdev id as `id "<value>"`.
fn qtree_contains(dump: &str, synthetic_id: &str) -> bool {
    dump.contains(&format!("id \"{synthetic_id}\""))
}
