//! Label transitions on the tracked issue.
//!
//! Labels are the only shared state between engine instances. A transition
//! removes the old label before adding the new one; the removal fails for
//! every caller but one, which makes it usable as a compare-and-swap.
//!
//! Removal alone cannot tell one application of a label from the next, so a
//! claim also checks the label timeline: if `from` was applied again after
//! the caller's snapshot, someone else already moved the task.

use chrono::{DateTime, Utc};

use crate::error::PlatformError;
use crate::platform::{PlatformClient, RepoRef};
use crate::task::{BotLabel, last_applied};

/// Move the issue from `from` to `to`.
///
/// Returns `Ok(false)` when `from` was no longer applied, i.e. someone else
/// moved the issue first. Other bot labels left over from a crashed attempt
/// are cleaned up after a successful transition.
pub async fn transition(
    platform: &dyn PlatformClient,
    repo: &RepoRef,
    number: u64,
    from: BotLabel,
    to: BotLabel,
) -> Result<bool, PlatformError> {
    swap(platform, repo, number, from, to, None).await
}

/// Claim the issue for work by moving `from` to `bot-working`.
///
/// `applied_at` is when `from` was applied in the caller's snapshot of the
/// task. A later application means the task changed hands since the
/// snapshot was taken, and the claim is lost. This also covers reclaiming a
/// stale `bot-working`, where `from` and the target are the same label.
pub async fn acquire(
    platform: &dyn PlatformClient,
    repo: &RepoRef,
    number: u64,
    from: BotLabel,
    applied_at: Option<DateTime<Utc>>,
) -> Result<bool, PlatformError> {
    swap(platform, repo, number, from, BotLabel::Working, applied_at).await
}

async fn swap(
    platform: &dyn PlatformClient,
    repo: &RepoRef,
    number: u64,
    from: BotLabel,
    to: BotLabel,
    applied_at: Option<DateTime<Utc>>,
) -> Result<bool, PlatformError> {
    let issue = platform.get_issue(repo, number).await?;
    if !issue.has_label(from.as_str()) {
        tracing::debug!("{}#{} no longer carries {}", repo, number, from);
        return Ok(false);
    }
    if let Some(expected) = applied_at {
        if reapplied(platform, repo, number, from, expected).await? {
            tracing::debug!("{} on {}#{} was re-applied since the snapshot", from, repo, number);
            return Ok(false);
        }
    }

    match platform.remove_label(repo, number, from.as_str()).await {
        Ok(()) => {}
        Err(PlatformError::NotFound(_)) => {
            tracing::debug!("{} was removed from {}#{} concurrently", from, repo, number);
            return Ok(false);
        }
        Err(e) => return Err(e),
    }

    // The removal may have hit a newer application by a concurrent claimer.
    if let Some(expected) = applied_at {
        if reapplied(platform, repo, number, from, expected).await? {
            tracing::debug!("Removed a newer {} on {}#{}, restoring it", from, repo, number);
            platform.add_label(repo, number, from.as_str()).await?;
            return Ok(false);
        }
    }
    platform.add_label(repo, number, to.as_str()).await?;

    for stale in BotLabel::ALL.iter().filter(|l| **l != to && **l != from) {
        if issue.has_label(stale.as_str()) {
            remove_if_present(platform, repo, number, *stale).await?;
        }
    }

    tracing::info!("{}#{}: {} -> {}", repo, number, from, to);
    Ok(true)
}

/// Whether `label` was applied after `expected`.
async fn reapplied(
    platform: &dyn PlatformClient,
    repo: &RepoRef,
    number: u64,
    label: BotLabel,
    expected: DateTime<Utc>,
) -> Result<bool, PlatformError> {
    let events = platform.list_label_events(repo, number).await?;
    Ok(last_applied(&events, label).is_some_and(|at| at > expected))
}

/// Remove every bot label. Used when a task is finished without a hand-back.
pub async fn release(
    platform: &dyn PlatformClient,
    repo: &RepoRef,
    number: u64,
) -> Result<(), PlatformError> {
    for label in BotLabel::ALL {
        remove_if_present(platform, repo, number, label).await?;
    }
    Ok(())
}

async fn remove_if_present(
    platform: &dyn PlatformClient,
    repo: &RepoRef,
    number: u64,
    label: BotLabel,
) -> Result<(), PlatformError> {
    match platform.remove_label(repo, number, label.as_str()).await {
        Ok(()) | Err(PlatformError::NotFound(_)) => Ok(()),
        Err(e) => Err(e),
    }
}
