use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use securechat_db::{Database, now_ts};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Periodic expiry sweep. Per-message timers armed at send time are faster
/// but die with the process; this loop is what guarantees that every
/// ephemeral message eventually gets cleared.
pub async fn run(db: Arc<Database>) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        ticker.tick().await;

        let db = db.clone();
        let result = tokio::task::spawn_blocking(move || db.expire_due_messages(&now_ts())).await;
        match result {
            Ok(Ok(0)) => {}
            Ok(Ok(n)) => info!("Expiry sweep cleared {} message(s)", n),
            Ok(Err(e)) => warn!("Expiry sweep failed: {:#}", e),
            Err(e) => warn!("Expiry sweep task panicked: {}", e),
        }
    }
}
