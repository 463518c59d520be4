//! Log-append collaborator
//!
//! Deploy outcomes are recorded per instance so they show up next to the
//! application's own output.

use crate::db::{Database, LogStream};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

/// Destination for instance log lines
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn append(&self, app_id: i64, stream: LogStream, message: &str, instance_id: &str);
}

/// Writes log lines to the `app_logs` table
pub struct DbLogSink {
    db: Arc<Database>,
}

impl DbLogSink {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl LogSink for DbLogSink {
    async fn append(&self, app_id: i64, stream: LogStream, message: &str, instance_id: &str) {
        // A lost log line must never fail a deploy
        if let Err(e) = self.db.append_log(app_id, stream, message, Some(instance_id)) {
            warn!(app_id, instance_id, error = %e, "Failed to append instance log");
        }
    }
}
