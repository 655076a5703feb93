use std::cmp::Ordering;

use crate::vault::models::{ConflictStrategy, SyncDocument};

/// What the merge pass decided for one record id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeAction {
    /// Both sides already agree.
    AlreadySynced,
    /// Local side dominates; propagate it to the remote.
    PropagateLocal,
    /// Remote side dominates; apply it locally.
    PropagateRemote,
    /// Divergent with no dominating side; run the conflict strategy.
    Conflict,
}

/// Merge decision: equal version + equal checksum is synced;
/// a strictly greater version wins only when its timestamp does not
/// contradict it; anything else is a conflict.
pub fn decide(local: &SyncDocument, remote: &SyncDocument) -> MergeAction {
    match local.version.cmp(&remote.version) {
        Ordering::Equal => {
            if local.checksum == remote.checksum {
                MergeAction::AlreadySynced
            } else {
                MergeAction::Conflict
            }
        }
        Ordering::Greater => {
            if local.updated_at >= remote.updated_at {
                MergeAction::PropagateLocal
            } else {
                MergeAction::Conflict
            }
        }
        Ordering::Less => {
            if remote.updated_at >= local.updated_at {
                MergeAction::PropagateRemote
            } else {
                MergeAction::Conflict
            }
        }
    }
}

/// Which side a conflict strategy picks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    Local,
    Remote,
    Manual,
}

/// Apply a resolution strategy to a detected conflict.
///
/// Last-write-wins orders by `updatedAt`, breaking ties by greater version
/// and then by lexicographically greater device id; first-write-wins is the
/// exact inverse. The priority strategies are unconditional and `manual`
/// defers to the user.
pub fn pick_winner(
    strategy: ConflictStrategy,
    local: &SyncDocument,
    remote: &SyncDocument,
) -> Winner {
    match strategy {
        ConflictStrategy::LocalPriority => Winner::Local,
        ConflictStrategy::RemotePriority => Winner::Remote,
        ConflictStrategy::Manual => Winner::Manual,
        ConflictStrategy::LastWriteWins => {
            if local_wins_last(local, remote) {
                Winner::Local
            } else {
                Winner::Remote
            }
        }
        ConflictStrategy::FirstWriteWins => {
            if local_wins_last(local, remote) {
                Winner::Remote
            } else {
                Winner::Local
            }
        }
    }
}

fn local_wins_last(local: &SyncDocument, remote: &SyncDocument) -> bool {
    match local.updated_at.cmp(&remote.updated_at) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => match local.version.cmp(&remote.version) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => local.device_id >= remote.device_id,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use crate::vault::models::base::SyncStatus;

    fn document(version: u64, minutes_ago: i64, device_id: &str) -> SyncDocument {
        SyncDocument {
            id: "r1".into(),
            entity_type: "SshProfile".into(),
            created_at: Utc::now() - Duration::hours(1),
            updated_at: Utc::now() - Duration::minutes(minutes_ago),
            device_id: device_id.into(),
            version,
            sync_status: SyncStatus::Pending,
            checksum: format!("sum-{}-{}", version, minutes_ago),
            payload: serde_json::json!({}),
        }
    }

    #[test]
    fn equal_version_equal_checksum_is_synced() {
        let mut local = document(5, 10, "dev-a");
        let mut remote = document(5, 10, "dev-b");
        local.checksum = "same".into();
        remote.checksum = "same".into();
        assert_eq!(decide(&local, &remote), MergeAction::AlreadySynced);
    }

    #[test]
    fn equal_version_diverged_content_is_a_conflict() {
        // Scenario: both devices bumped v5 -> v6 independently.
        let local = document(6, 10, "dev-a");
        let remote = document(6, 5, "dev-b");
        assert_eq!(decide(&local, &remote), MergeAction::Conflict);
    }

    #[test]
    fn strictly_greater_version_with_agreeing_time_propagates() {
        let local = document(7, 5, "dev-a");
        let remote = document(6, 10, "dev-b");
        assert_eq!(decide(&local, &remote), MergeAction::PropagateLocal);

        assert_eq!(decide(&remote, &local), MergeAction::PropagateRemote);
    }

    #[test]
    fn greater_version_with_older_timestamp_is_incomparable() {
        // Higher version but written earlier: neither side dominates.
        let local = document(7, 30, "dev-a");
        let remote = document(6, 5, "dev-b");
        assert_eq!(decide(&local, &remote), MergeAction::Conflict);
    }

    #[test]
    fn last_write_wins_prefers_newer_timestamp() {
        let local = document(6, 20, "dev-a");
        let remote = document(6, 5, "dev-b");
        assert_eq!(
            pick_winner(ConflictStrategy::LastWriteWins, &local, &remote),
            Winner::Remote
        );
        assert_eq!(
            pick_winner(ConflictStrategy::FirstWriteWins, &local, &remote),
            Winner::Local
        );
    }

    #[test]
    fn last_write_ties_break_on_version_then_device() {
        let now = Utc::now();
        let mut local = document(7, 0, "dev-a");
        let mut remote = document(6, 0, "dev-b");
        local.updated_at = now;
        remote.updated_at = now;
        assert_eq!(
            pick_winner(ConflictStrategy::LastWriteWins, &local, &remote),
            Winner::Local
        );

        local.version = 6;
        assert_eq!(
            pick_winner(ConflictStrategy::LastWriteWins, &local, &remote),
            Winner::Remote
        );
    }

    #[test]
    fn priority_strategies_are_unconditional() {
        let local = document(1, 0, "dev-a");
        let remote = document(9, 0, "dev-b");
        assert_eq!(
            pick_winner(ConflictStrategy::LocalPriority, &local, &remote),
            Winner::Local
        );
        assert_eq!(
            pick_winner(ConflictStrategy::RemotePriority, &local, &remote),
            Winner::Remote
        );
        assert_eq!(
            pick_winner(ConflictStrategy::Manual, &local, &remote),
            Winner::Manual
        );
    }
}
