use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::service::TicketService;

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Periodically fail expired approvals, purge old sessions, and trim the cache.
pub fn start_sweeper(service: Arc<TicketService>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match service.engine().evict_expired() {
                Ok(report) if !report.expired.is_empty() || report.purged > 0 => {
                    info!(expired = report.expired.len(), purged = report.purged, "session sweep");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "session sweep failed"),
            }
            let purged = service.cache().purge_expired();
            if purged > 0 {
                debug!(purged, "classification cache sweep");
            }
        }
    })
}
