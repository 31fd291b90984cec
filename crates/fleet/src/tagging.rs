//! Verified tag mutation on top of an eventually consistent tag store.
//!
//! The tag store is a plain list per resource, not a map: attaching
//! `ray-node-status:up-to-date` leaves `ray-node-status:setting-up` in place.
//! Every mutation is therefore followed by a read-back, and status changes
//! detach the rest of the status family explicitly.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::clients::SharedClients;
use crate::config::Timings;
use crate::error::ProviderError;
use crate::node::{tags_to_list, StatusTag, TAG_NODE_STATUS};

/// Attempts per tag operation.
pub const TAG_ATTEMPTS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TagOp {
    Attach,
    Detach,
}

impl TagOp {
    fn as_str(self) -> &'static str {
        match self {
            Self::Attach => "attach",
            Self::Detach => "detach",
        }
    }

    /// Whether `current` reflects the operation on `tags`.
    fn verified(self, tags: &[String], current: &[String]) -> bool {
        let current: HashSet<&str> = current.iter().map(String::as_str).collect();
        match self {
            Self::Attach => tags.iter().all(|t| current.contains(t.as_str())),
            Self::Detach => tags.iter().all(|t| !current.contains(t.as_str())),
        }
    }
}

/// Attach/detach/list tags with read-after-write verification.
#[derive(Debug, Clone)]
pub struct TagManager {
    clients: Arc<SharedClients>,
    attempts: u32,
    delay: Duration,
    settle: Duration,
}

impl TagManager {
    #[must_use]
    pub fn new(clients: Arc<SharedClients>, timings: &Timings) -> Self {
        Self {
            clients,
            attempts: TAG_ATTEMPTS,
            delay: timings.tag_retry_delay(),
            settle: timings.status_settle(),
        }
    }

    /// List tags attached to `crn`.
    ///
    /// # Errors
    /// Returns the last backend error if every attempt fails.
    pub async fn list(&self, crn: &str) -> Result<Vec<String>, ProviderError> {
        let mut last_err = None;
        for attempt in 0..self.attempts {
            if attempt > 0 {
                info!(crn = %crn, attempt, "Retrying tag listing");
            }
            match self.clients.tagging().list_tags(crn).await {
                Ok(tags) => return Ok(tags),
                Err(e) => {
                    error!(crn = %crn, error = %e, "Failed to list tags");
                    last_err = Some(ProviderError::from(e));
                }
            }
            self.backoff(attempt).await;
        }
        Err(last_err.unwrap_or_else(|| ProviderError::Config("tag attempts set to zero".into())))
    }

    /// Attach `tags` to `crn` and confirm they are listed afterwards.
    ///
    /// Returns `Ok(false)` if verification never succeeded and no call failed.
    ///
    /// # Errors
    /// Returns the last error seen if any attempt failed with one.
    pub async fn attach(&self, crn: &str, tags: &[String]) -> Result<bool, ProviderError> {
        self.mutate(TagOp::Attach, crn, tags).await
    }

    /// Detach `tags` from `crn` and confirm none of them is listed afterwards.
    ///
    /// # Errors
    /// Returns the last error seen if any attempt failed with one.
    pub async fn detach(&self, crn: &str, tags: &[String]) -> Result<bool, ProviderError> {
        self.mutate(TagOp::Detach, crn, tags).await
    }

    /// Make `status` the only status tag on `crn`.
    ///
    /// # Errors
    /// Returns [`ProviderError::TagVerification`] when either the new tag or
    /// the removal of the previous ones could not be confirmed, or the
    /// underlying backend error.
    pub async fn set_status_tag(&self, crn: &str, status: StatusTag) -> Result<(), ProviderError> {
        let tag = vec![status.tag()];
        if !self.attach(crn, &tag).await? {
            return Err(ProviderError::TagVerification {
                operation: "attach",
                crn: crn.to_string(),
                tags: tag,
            });
        }

        let stale = status.others();
        if !self.detach(crn, &stale).await? {
            error!(crn = %crn, status = %status, "Failed to detach previous status tags");
            return Err(ProviderError::TagVerification {
                operation: "detach",
                crn: crn.to_string(),
                tags: stale,
            });
        }
        debug!(crn = %crn, status = %status, "Status tag replaced");
        tokio::time::sleep(self.settle).await;
        Ok(())
    }

    /// Apply a tag map, swapping the status tag family when it is present.
    ///
    /// # Errors
    /// Returns [`ProviderError::TagVerification`] when the tags could not be
    /// confirmed, or the underlying backend error.
    pub async fn apply(
        &self,
        crn: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<(), ProviderError> {
        let mut rest = tags.clone();
        let status: Option<StatusTag> = rest
            .remove(TAG_NODE_STATUS)
            .map(|value| value.parse())
            .transpose()?;

        let new_tags = tags_to_list(&rest);
        if !new_tags.is_empty() {
            if !self.attach(crn, &new_tags).await? {
                return Err(ProviderError::TagVerification {
                    operation: "attach",
                    crn: crn.to_string(),
                    tags: new_tags,
                });
            }
            info!(crn = %crn, tags = ?new_tags, "Attached tags");
        }

        if let Some(status) = status {
            self.set_status_tag(crn, status).await?;
        }
        Ok(())
    }

    async fn mutate(&self, op: TagOp, crn: &str, tags: &[String]) -> Result<bool, ProviderError> {
        let mut last_err = None;

        for attempt in 0..self.attempts {
            if attempt > 0 {
                info!(crn = %crn, attempt, operation = op.as_str(), "Retrying tag operation");
            }

            let tagging = self.clients.tagging();
            let outcome = match op {
                TagOp::Attach => tagging.attach_tags(crn, tags).await,
                TagOp::Detach => tagging.detach_tags(crn, tags).await,
            };

            match outcome {
                Ok(true) => match self.list(crn).await {
                    Ok(current) if op.verified(tags, &current) => return Ok(true),
                    Ok(current) => {
                        warn!(
                            crn = %crn,
                            operation = op.as_str(),
                            requested = ?tags,
                            listed = ?current,
                            "Tag change not visible yet"
                        );
                    }
                    Err(e) => last_err = Some(e),
                },
                Ok(false) => {
                    error!(
                        crn = %crn,
                        operation = op.as_str(),
                        tags = ?tags,
                        "Backend rejected tag operation"
                    );
                }
                Err(e) => {
                    error!(crn = %crn, operation = op.as_str(), error = %e, "Tag operation failed");
                    last_err = Some(e.into());
                }
            }

            self.backoff(attempt).await;
        }

        match last_err {
            Some(e) => Err(e),
            None => Ok(false),
        }
    }

    /// Sleep between attempts, reinitializing the tagging client halfway
    /// through the budget.
    async fn backoff(&self, attempt: u32) {
        if attempt + 1 >= self.attempts {
            return;
        }
        if attempt == self.attempts / 2 {
            if let Err(e) = self.clients.reinit_tagging() {
                warn!(error = %e, "Tagging client reinitialization failed");
            }
        }
        tokio::time::sleep(self.delay).await;
    }
}
