use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{info, instrument, warn};

use argus_core::session::SessionStatus;
use argus_core::time::now_ms;
use argus_store::sessions::{self, SessionRepo};
use argus_store::{relationships, Database, StoreError};

use crate::updates::Update;

/// Marks active sessions with no event activity inside the idle window
/// as timed out. Producers that die without a Stop/SubagentStop hook
/// would otherwise stay "active" forever.
pub struct TimeoutSweeper {
    db: Database,
    updates_tx: broadcast::Sender<Update>,
    idle: Duration,
}

impl TimeoutSweeper {
    pub fn new(db: Database, updates_tx: broadcast::Sender<Update>, idle: Duration) -> Self {
        Self {
            db,
            updates_tx,
            idle,
        }
    }

    /// One sweep pass. Returns the session ids that were timed out.
    #[instrument(skip(self))]
    pub fn sweep(&self) -> Result<Vec<String>, StoreError> {
        let cutoff = (Utc::now()
            - chrono::Duration::from_std(self.idle).unwrap_or(chrono::Duration::zero()))
        .to_rfc3339();

        let stale = SessionRepo::new(self.db.clone()).list_stale_active(&cutoff)?;
        let mut timed_out = Vec::new();

        for session in stale {
            let session_id = session.session_id.clone();
            let changed = self.db.with_tx(|conn| {
                let changed = sessions::update_status_tx(conn, &session_id, SessionStatus::Timeout)?;
                if changed {
                    sessions::set_end_tx(conn, &session_id, now_ms())?;
                    relationships::complete_tx(conn, &session_id, now_ms())?;
                }
                Ok(changed)
            })?;

            if changed {
                info!(session_id = %session_id, "session timed out after inactivity");
                let _ = self.updates_tx.send(Update::SessionTimeout {
                    session_id: session_id.clone(),
                });
                timed_out.push(session_id.as_str().to_string());
            }
        }

        Ok(timed_out)
    }

    /// Spawn the periodic sweep task. An idle window of zero disables
    /// the sweeper.
    pub fn spawn(self, interval: Duration) -> Option<tokio::task::JoinHandle<()>> {
        if self.idle.is_zero() {
            return None;
        }
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = self.sweep() {
                    warn!(error = %e, "timeout sweep failed");
                }
            }
        }))
    }
}
