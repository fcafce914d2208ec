use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use murmur_db::Database;

/// Background task that deletes expired typing rows. Reads already ignore
/// them; this only keeps the table small.
pub async fn run_typing_sweep(db: Arc<Database>, interval_secs: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        interval.tick().await;

        let sweep_db = db.clone();
        match tokio::task::spawn_blocking(move || sweep_db.purge_expired_typing()).await {
            Ok(Ok(count)) => {
                if count > 0 {
                    debug!("Typing sweep: purged {} expired indicators", count);
                }
            }
            Ok(Err(e)) => warn!("Typing sweep error: {}", e),
            Err(e) => warn!("spawn_blocking join error: {}", e),
        }
    }
}
