use std::fmt;
use std::future::Future;

use resticd_common::{
    sanitize_message, BackupError, OperationKind, OperationRecord, Result,
};
use tracing::{info, warn};

use crate::status::{Claim, StatusStore};

/// Serializes same-kind operations per entity through the status store.
#[derive(Debug, Clone)]
pub struct ConcurrencyGuard {
    store: StatusStore,
    message_limit: usize,
}

impl ConcurrencyGuard {
    pub fn new(store: StatusStore, message_limit: usize) -> Self {
        Self {
            store,
            message_limit,
        }
    }

    pub fn store(&self) -> &StatusStore {
        &self.store
    }

    /// Claim `(entity, kind)` or fail with `Conflict` while a live run holds it.
    pub async fn begin(&self, entity: &str, kind: OperationKind) -> Result<OperationTicket> {
        match self.store.claim_running(entity, kind).await? {
            Claim::Accepted(record) => {
                info!(entity, %kind, "Operation claimed");
                Ok(OperationTicket {
                    store: self.store.clone(),
                    entity: entity.to_string(),
                    kind,
                    secrets: Vec::new(),
                    message_limit: self.message_limit,
                    record,
                })
            }
            Claim::Conflict(current) => {
                warn!(entity, %kind, started_at = ?current.started_at, "Operation already running");
                Err(BackupError::Conflict(format!(
                    "{} already running for {}",
                    kind, entity
                )))
            }
        }
    }
}

/// A claimed running record. Consumed by exactly one terminal transition.
pub struct OperationTicket {
    store: StatusStore,
    entity: String,
    kind: OperationKind,
    secrets: Vec<String>,
    message_limit: usize,
    record: OperationRecord,
}

impl fmt::Debug for OperationTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationTicket")
            .field("entity", &self.entity)
            .field("kind", &self.kind)
            .field("record", &self.record)
            .finish_non_exhaustive()
    }
}

impl OperationTicket {
    /// Redact this key from any failure message written by the ticket.
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        let secret = secret.into();
        if !secret.is_empty() && !self.secrets.contains(&secret) {
            self.secrets.push(secret);
        }
        self
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn record(&self) -> &OperationRecord {
        &self.record
    }

    /// `None` when a newer run has taken the record over.
    pub async fn complete(self) -> Result<Option<OperationRecord>> {
        let record = self
            .store
            .complete(&self.entity, self.kind, self.record.started_at)
            .await?;
        if record.is_some() {
            info!(entity = %self.entity, kind = %self.kind, "Operation completed");
        }
        Ok(record)
    }

    /// `message` with every registered secret replaced and clamped to the limit.
    pub fn redact(&self, message: &str) -> String {
        let redacted = self
            .secrets
            .iter()
            .fold(message.to_string(), |msg, secret| {
                sanitize_message(&msg, Some(secret.as_str()), usize::MAX)
            });
        sanitize_message(&redacted, None, self.message_limit)
    }

    pub async fn fail(self, message: &str) -> Result<Option<OperationRecord>> {
        let message = self.redact(message);
        let record = self
            .store
            .fail(&self.entity, self.kind, self.record.started_at, &message)
            .await?;
        if record.is_some() {
            warn!(entity = %self.entity, kind = %self.kind, %message, "Operation failed");
        }
        Ok(record)
    }

    /// Completed on `None`, failed with the message otherwise.
    pub async fn settle(self, failure: Option<String>) -> Result<Option<OperationRecord>> {
        match failure {
            None => self.complete().await,
            Some(message) => self.fail(&message).await,
        }
    }

    /// Write the terminal state matching `outcome`. The returned future does not borrow it.
    pub fn finish<T>(
        self,
        outcome: &Result<T>,
    ) -> impl Future<Output = Result<Option<OperationRecord>>> + Send {
        let failure = outcome.as_ref().err().map(ToString::to_string);
        self.settle(failure)
    }
}
