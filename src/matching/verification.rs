/// Match Verification Workflow
///
/// Operator-facing state machine for a single candidate:
///
/// ```text
/// unverified --verify--> verified
///     |                     |
///     +------reject-------> rejected
/// ```
///
/// Both dispositions are status transitions on the same row, so rejected
/// candidates keep an audit trail. Hard deletion is reserved for `erase`.
/// The attendee's `matches_found` counter is committed together with each
/// transition into or out of `verified`, so it moves exactly once per
/// transition even when a write fails halfway.
use crate::{
    error::{HubError, HubResult},
    matching::{CandidateStatus, MatchCandidate},
    metrics,
    notify::FanOut,
    photos::Photo,
    events::Event,
    store::{
        self, patch, tables, timestamp, CounterDelta, Direction, Filter, Query, RecordStore, Row,
    },
};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

/// Attempts at a guarded transition before giving up on a contended row
const TRANSITION_ATTEMPTS: usize = 3;

/// Candidate moderation
#[derive(Clone)]
pub struct MatchVerifier {
    store: Arc<dyn RecordStore>,
    fanout: FanOut,
}

impl MatchVerifier {
    pub fn new(store: Arc<dyn RecordStore>, fanout: FanOut) -> Self {
        Self { store, fanout }
    }

    /// Rows neither verified nor rejected (missing fields count as unverified)
    fn unverified_guard() -> Filter {
        Filter::new()
            .neq("status", CandidateStatus::Verified.as_str())
            .neq("status", CandidateStatus::Rejected.as_str())
            .neq("is_verified", true)
    }

    fn verified_guard() -> Filter {
        Filter::new()
            .neq("status", CandidateStatus::Rejected.as_str())
            .eq("is_verified", true)
    }

    pub async fn get(&self, id: &str) -> HubResult<MatchCandidate> {
        store::fetch(self.store.as_ref(), id).await
    }

    /// Verify a candidate
    ///
    /// Idempotent: verifying an already verified candidate returns it without
    /// touching the counter. Verifying a rejected candidate is a constraint
    /// violation.
    pub async fn verify(&self, candidate_id: &str, verifier_id: &str) -> HubResult<MatchCandidate> {
        if verifier_id.trim().is_empty() {
            return Err(HubError::Validation("Verifier id is required".to_string()));
        }

        for _ in 0..TRANSITION_ATTEMPTS {
            let current = self.get(candidate_id).await?;
            match current.disposition() {
                CandidateStatus::Verified => return Ok(current),
                CandidateStatus::Rejected => {
                    return Err(HubError::Constraint(format!(
                        "Candidate {} was rejected and cannot be verified",
                        candidate_id
                    )))
                }
                CandidateStatus::Unverified => {}
            }

            let verified = patch(json!({
                "status": CandidateStatus::Verified.as_str(),
                "is_verified": true,
                "verified_by": verifier_id,
                "verified_at": timestamp::value(&timestamp::now()),
            }));

            if let Some(candidate) = transition(
                self.store.as_ref(),
                &current,
                &Self::unverified_guard(),
                verified,
                1,
            )
            .await?
            {
                metrics::record_disposition("verified");
                info!(
                    candidate_id,
                    user_id = %candidate.user_id,
                    verifier_id,
                    "Verified face match"
                );

                self.announce_match(&candidate).await;
                return Ok(candidate);
            }
        }

        Err(HubError::Constraint(format!(
            "Candidate {} changed concurrently",
            candidate_id
        )))
    }

    /// Reject a candidate
    ///
    /// Unknown ids succeed with `None`. Rejecting a verified candidate
    /// withdraws the verification and gives back its counter increment.
    pub async fn reject(
        &self,
        candidate_id: &str,
        operator_id: &str,
    ) -> HubResult<Option<MatchCandidate>> {
        if operator_id.trim().is_empty() {
            return Err(HubError::Validation("Operator id is required".to_string()));
        }

        for _ in 0..TRANSITION_ATTEMPTS {
            let Some(current) = store::find::<MatchCandidate>(self.store.as_ref(), candidate_id).await?
            else {
                info!(candidate_id, "Reject of unknown candidate treated as done");
                return Ok(None);
            };

            let was_verified = match current.disposition() {
                CandidateStatus::Rejected => return Ok(Some(current)),
                CandidateStatus::Verified => true,
                CandidateStatus::Unverified => false,
            };
            let (guard, delta) = if was_verified {
                (Self::verified_guard(), -1)
            } else {
                (Self::unverified_guard(), 0)
            };

            let rejected = patch(json!({
                "status": CandidateStatus::Rejected.as_str(),
                "is_verified": false,
                "verified_by": Value::Null,
                "verified_at": Value::Null,
                "rejected_by": operator_id,
                "rejected_at": timestamp::value(&timestamp::now()),
            }));

            if let Some(candidate) =
                transition(self.store.as_ref(), &current, &guard, rejected, delta).await?
            {
                metrics::record_disposition("rejected");
                info!(
                    candidate_id,
                    user_id = %candidate.user_id,
                    operator_id,
                    was_verified,
                    "Rejected face match"
                );
                return Ok(Some(candidate));
            }
        }

        Err(HubError::Constraint(format!(
            "Candidate {} changed concurrently",
            candidate_id
        )))
    }

    /// Hard delete for erasure requests; missing candidates are not an error
    pub async fn erase(&self, candidate_id: &str) -> HubResult<bool> {
        let Some(row) = self
            .store
            .delete(tables::MATCH_CANDIDATES, candidate_id)
            .await?
        else {
            return Ok(false);
        };

        // The deleted row is the last state anyone saw
        let candidate: MatchCandidate = store::from_row(row)?;
        if candidate.disposition() == CandidateStatus::Verified {
            adjust_matches_found(self.store.as_ref(), &candidate.user_id, -1).await?;
        }
        metrics::record_disposition("erased");
        info!(candidate_id, user_id = %candidate.user_id, "Erased face match");
        Ok(true)
    }

    /// Candidates for a photo excluding rejected ones, most confident first
    pub async fn list_for_photo(&self, photo_id: &str) -> HubResult<Vec<MatchCandidate>> {
        let query = Query::filtered(
            Filter::new()
                .eq("photo_id", photo_id)
                .neq("status", CandidateStatus::Rejected.as_str()),
        )
        .order_by("confidence_score", Direction::Desc);
        store::select(self.store.as_ref(), &query).await
    }

    /// Verified matches of one attendee, most confident first
    pub async fn list_for_user(&self, user_id: &str) -> HubResult<Vec<MatchCandidate>> {
        let query = Query::filtered(
            Filter::new()
                .eq("user_id", user_id)
                .eq("is_verified", true)
                .neq("status", CandidateStatus::Rejected.as_str()),
        )
        .order_by("confidence_score", Direction::Desc);
        store::select(self.store.as_ref(), &query).await
    }

    /// Moderation backlog: undecided candidates, most confident first
    pub async fn list_unverified(&self, limit: i64) -> HubResult<Vec<MatchCandidate>> {
        if limit <= 0 {
            return Err(HubError::Validation("Limit must be positive".to_string()));
        }
        let query = Query::filtered(Self::unverified_guard())
            .order_by("confidence_score", Direction::Desc)
            .limit(limit);
        store::select(self.store.as_ref(), &query).await
    }

    /// Best-effort photo-match notification
    async fn announce_match(&self, candidate: &MatchCandidate) {
        let photo = match store::find::<Photo>(self.store.as_ref(), &candidate.photo_id).await {
            Ok(photo) => photo,
            Err(e) => {
                warn!(photo_id = %candidate.photo_id, error = %e, "Failed to load matched photo");
                None
            }
        };
        let event = match &photo {
            Some(photo) => store::find::<Event>(self.store.as_ref(), &photo.event_id)
                .await
                .unwrap_or_else(|e| {
                    warn!(event_id = %photo.event_id, error = %e, "Failed to load event");
                    None
                }),
            None => None,
        };
        let event_name = event
            .as_ref()
            .map(|e| e.name.as_str())
            .unwrap_or("an event");

        if let Err(e) = self
            .fanout
            .photo_match_found(
                &candidate.user_id,
                &candidate.photo_id,
                photo.as_ref().map(|p| p.event_id.as_str()),
                event_name,
                candidate.confidence_percent(),
            )
            .await
        {
            warn!(
                candidate_id = %candidate.id,
                user_id = %candidate.user_id,
                error = %e,
                "Failed to send photo match notification"
            );
        }
    }
}

/// Guarded candidate update committed with its `matches_found` adjustment
///
/// `None` when the guard no longer holds.
async fn transition(
    store: &dyn RecordStore,
    current: &MatchCandidate,
    guard: &Filter,
    changes: Row,
    delta: i64,
) -> HubResult<Option<MatchCandidate>> {
    if delta == 0 {
        return store
            .update_where(tables::MATCH_CANDIDATES, &current.id, guard, changes)
            .await?
            .map(store::from_row)
            .transpose();
    }

    let counter = CounterDelta {
        table: tables::EVENT_USERS,
        id: &current.user_id,
        field: "matches_found",
        delta,
    };
    let Some(update) = store
        .update_where_counted(tables::MATCH_CANDIDATES, &current.id, guard, changes, counter)
        .await?
    else {
        return Ok(None);
    };

    if update.counter.is_none() {
        warn!(
            user_id = %current.user_id,
            "Matched user is not a registered event user; counter not updated"
        );
    }
    store::from_row(update.row).map(Some)
}

pub(crate) async fn adjust_matches_found(
    store: &dyn RecordStore,
    user_id: &str,
    delta: i64,
) -> HubResult<()> {
    match store
        .increment(tables::EVENT_USERS, user_id, "matches_found", delta)
        .await
    {
        Ok(_) => Ok(()),
        Err(HubError::NotFound(_)) => {
            warn!(user_id, "Matched user is not a registered event user; counter not updated");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Move every verified candidate of a photo back to unverified, giving
/// back each attendee's counter. Returns how many were withdrawn.
pub(crate) async fn withdraw_photo_matches(
    store: &dyn RecordStore,
    photo_id: &str,
) -> HubResult<u64> {
    let query = Query::filtered(MatchVerifier::verified_guard().eq("photo_id", photo_id));
    let verified: Vec<MatchCandidate> = store::select(store, &query).await?;

    let mut withdrawn = 0;
    for candidate in &verified {
        let changes = patch(json!({
            "status": CandidateStatus::Unverified.as_str(),
            "is_verified": false,
            "verified_by": Value::Null,
            "verified_at": Value::Null,
        }));
        if transition(store, candidate, &MatchVerifier::verified_guard(), changes, -1)
            .await?
            .is_some()
        {
            withdrawn += 1;
        }
    }
    Ok(withdrawn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::notify::{NotificationPayload, Notifier};
    use crate::store::testing::{HookedStore, StoreHooks};
    use crate::store::SqliteRecordStore;

    struct Fixture {
        verifier: MatchVerifier,
        store: Arc<SqliteRecordStore>,
        notifier: Notifier,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(SqliteRecordStore::new(db::connect_in_memory().await.unwrap()));
        let notifier = Notifier::new(store.clone(), 30);
        let verifier = MatchVerifier::new(store.clone(), FanOut::new(notifier.clone()));

        store
            .insert(
                tables::EVENTS,
                patch(json!({"id": "e1", "name": "Summer Gala", "date": "2024-07-01",
                              "created_at": "2024-06-01T00:00:00.000000Z"})),
            )
            .await
            .unwrap();
        store
            .insert(
                tables::PHOTOS,
                patch(json!({
                    "id": "p1",
                    "event_id": "e1",
                    "url": "http://localhost/storage/event-photos/e1/p1.jpg",
                    "bucket": "event-photos",
                    "storage_path": "e1/p1.jpg",
                    "is_public": true,
                    "file_size": 3,
                    "mime_type": "image/jpeg",
                    "created_at": "2024-06-01T00:00:00.000000Z"
                })),
            )
            .await
            .unwrap();
        for user in ["u1", "u2"] {
            store
                .insert(
                    tables::EVENT_USERS,
                    patch(json!({"id": user, "event_id": "e1", "matches_found": 0})),
                )
                .await
                .unwrap();
        }

        Fixture {
            verifier,
            store,
            notifier,
        }
    }

    async fn candidate(store: &SqliteRecordStore, id: &str, user: &str, score: f64) {
        store
            .insert(
                tables::MATCH_CANDIDATES,
                patch(json!({
                    "id": id,
                    "photo_id": "p1",
                    "user_id": user,
                    "confidence_score": score,
                    "bounding_box": {"x": 1.0, "y": 2.0, "width": 30.0, "height": 30.0},
                    "is_verified": false,
                    "verified_by": null,
                    "verified_at": null
                })),
            )
            .await
            .unwrap();
    }

    async fn matches_found(store: &SqliteRecordStore, user: &str) -> i64 {
        store
            .get(tables::EVENT_USERS, user)
            .await
            .unwrap()
            .unwrap()
            .get("matches_found")
            .and_then(Value::as_i64)
            .unwrap()
    }

    #[tokio::test]
    async fn test_verify_sets_fields_and_increments_once() {
        let f = fixture().await;
        candidate(&f.store, "c1", "u1", 0.93).await;

        let first = f.verifier.verify("c1", "op-1").await.unwrap();
        assert!(first.is_verified);
        assert_eq!(first.status, CandidateStatus::Verified);
        assert_eq!(first.verified_by.as_deref(), Some("op-1"));
        assert!(first.verified_at.is_some());

        let second = f.verifier.verify("c1", "op-2").await.unwrap();
        assert_eq!(second.verified_by.as_deref(), Some("op-1"));
        assert_eq!(matches_found(&f.store, "u1").await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_verifications_for_same_user_are_counted() {
        let f = fixture().await;
        for i in 0..6 {
            candidate(&f.store, &format!("c{}", i), "u1", 0.8).await;
        }

        let mut handles = Vec::new();
        for i in 0..6 {
            let verifier = f.verifier.clone();
            handles.push(tokio::spawn(async move {
                verifier.verify(&format!("c{}", i), "op-1").await
            }));
            // Same candidate twice in parallel must still count once
            let verifier = f.verifier.clone();
            handles.push(tokio::spawn(async move {
                verifier.verify(&format!("c{}", i), "op-2").await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(matches_found(&f.store, "u1").await, 6);
    }

    #[tokio::test]
    async fn test_verify_missing_is_not_found() {
        let f = fixture().await;
        assert!(matches!(
            f.verifier.verify("nope", "op-1").await.unwrap_err(),
            HubError::NotFound(_)
        ));
        assert!(matches!(
            f.verifier.verify("nope", "").await.unwrap_err(),
            HubError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn test_verify_sends_photo_match_notification() {
        let f = fixture().await;
        candidate(&f.store, "c1", "u1", 0.876).await;
        f.verifier.verify("c1", "op-1").await.unwrap();

        let inbox = f.notifier.list_for_user("u1", false, None).await.unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(
            inbox[0].message,
            "You appear in a photo from Summer Gala (88% match)."
        );
        assert!(matches!(
            inbox[0].data,
            NotificationPayload::PhotoMatch { ref photo_id, .. } if photo_id == "p1"
        ));

        // No second notification on a repeated verify
        f.verifier.verify("c1", "op-1").await.unwrap();
        assert_eq!(f.notifier.unread_count("u1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reject_hides_candidate_and_keeps_audit() {
        let f = fixture().await;
        candidate(&f.store, "c1", "u1", 0.9).await;
        candidate(&f.store, "c2", "u2", 0.7).await;

        let rejected = f.verifier.reject("c1", "op-1").await.unwrap().unwrap();
        assert_eq!(rejected.status, CandidateStatus::Rejected);
        assert_eq!(rejected.rejected_by.as_deref(), Some("op-1"));

        let listed = f.verifier.list_for_photo("p1").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "c2");

        // Row is still there for the audit trail
        assert!(f.store.get(tables::MATCH_CANDIDATES, "c1").await.unwrap().is_some());

        assert!(matches!(
            f.verifier.verify("c1", "op-1").await.unwrap_err(),
            HubError::Constraint(_)
        ));
    }

    #[tokio::test]
    async fn test_reject_unknown_and_repeated_is_ok() {
        let f = fixture().await;
        assert!(f.verifier.reject("missing", "op-1").await.unwrap().is_none());

        candidate(&f.store, "c1", "u1", 0.9).await;
        f.verifier.reject("c1", "op-1").await.unwrap();
        let again = f.verifier.reject("c1", "op-2").await.unwrap().unwrap();
        assert_eq!(again.rejected_by.as_deref(), Some("op-1"));
    }

    #[tokio::test]
    async fn test_reject_verified_gives_back_counter() {
        let f = fixture().await;
        candidate(&f.store, "c1", "u1", 0.9).await;
        f.verifier.verify("c1", "op-1").await.unwrap();
        assert_eq!(matches_found(&f.store, "u1").await, 1);

        let rejected = f.verifier.reject("c1", "op-1").await.unwrap().unwrap();
        assert!(!rejected.is_verified);
        assert!(rejected.verified_by.is_none());
        assert_eq!(matches_found(&f.store, "u1").await, 0);
        assert!(f.verifier.list_for_user("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_for_user_only_verified() {
        let f = fixture().await;
        candidate(&f.store, "c1", "u1", 0.6).await;
        candidate(&f.store, "c2", "u1", 0.95).await;
        candidate(&f.store, "c3", "u1", 0.8).await;
        candidate(&f.store, "c4", "u2", 0.99).await;

        f.verifier.verify("c1", "op-1").await.unwrap();
        f.verifier.verify("c2", "op-1").await.unwrap();
        f.verifier.verify("c4", "op-1").await.unwrap();

        let mine = f.verifier.list_for_user("u1").await.unwrap();
        let ids: Vec<_> = mine.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c2", "c1"]);
        assert!(mine.iter().all(|c| c.is_verified));
    }

    #[tokio::test]
    async fn test_list_for_photo_orders_by_confidence() {
        let f = fixture().await;
        candidate(&f.store, "c1", "u1", 0.5).await;
        candidate(&f.store, "c2", "u2", 0.9).await;
        candidate(&f.store, "c3", "u2", 0.5).await;

        let ids: Vec<_> = f
            .verifier
            .list_for_photo("p1")
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec!["c2", "c1", "c3"]);
    }

    #[tokio::test]
    async fn test_list_unverified() {
        let f = fixture().await;
        candidate(&f.store, "c1", "u1", 0.5).await;
        candidate(&f.store, "c2", "u2", 0.9).await;
        candidate(&f.store, "c3", "u2", 0.7).await;
        f.verifier.verify("c2", "op-1").await.unwrap();
        f.verifier.reject("c3", "op-1").await.unwrap();

        let backlog = f.verifier.list_unverified(10).await.unwrap();
        assert_eq!(backlog.len(), 1);
        assert_eq!(backlog[0].id, "c1");
    }

    #[tokio::test]
    async fn test_erase() {
        let f = fixture().await;
        candidate(&f.store, "c1", "u1", 0.9).await;
        f.verifier.verify("c1", "op-1").await.unwrap();

        assert!(f.verifier.erase("c1").await.unwrap());
        assert!(!f.verifier.erase("c1").await.unwrap());
        assert_eq!(matches_found(&f.store, "u1").await, 0);
    }

    #[tokio::test]
    async fn test_failed_counter_write_leaves_candidate_unverified() {
        let f = fixture().await;
        candidate(&f.store, "c1", "u1", 0.9).await;
        sqlx::query(
            "CREATE TRIGGER block_counters BEFORE UPDATE ON records
             WHEN NEW.table_name = 'event_users'
             BEGIN SELECT RAISE(ABORT, 'counter unavailable'); END",
        )
        .execute(f.store.pool())
        .await
        .unwrap();

        assert!(f.verifier.verify("c1", "op-1").await.is_err());
        let current = f.verifier.get("c1").await.unwrap();
        assert_eq!(current.disposition(), CandidateStatus::Unverified);
        assert_eq!(matches_found(&f.store, "u1").await, 0);

        // A retry once the counter is writable counts exactly once
        sqlx::query("DROP TRIGGER block_counters")
            .execute(f.store.pool())
            .await
            .unwrap();
        f.verifier.verify("c1", "op-1").await.unwrap();
        assert_eq!(matches_found(&f.store, "u1").await, 1);
    }

    #[tokio::test]
    async fn test_failed_counter_write_keeps_verified_on_reject() {
        let f = fixture().await;
        candidate(&f.store, "c1", "u1", 0.9).await;
        f.verifier.verify("c1", "op-1").await.unwrap();
        sqlx::query(
            "CREATE TRIGGER block_counters BEFORE UPDATE ON records
             WHEN NEW.table_name = 'event_users'
             BEGIN SELECT RAISE(ABORT, 'counter unavailable'); END",
        )
        .execute(f.store.pool())
        .await
        .unwrap();

        assert!(f.verifier.reject("c1", "op-1").await.is_err());
        assert!(f.verifier.get("c1").await.unwrap().is_verified);
        assert_eq!(matches_found(&f.store, "u1").await, 1);
    }

    /// Verifies the candidate just before the delete reaches the store
    struct VerifyBeforeDelete;

    #[async_trait::async_trait]
    impl StoreHooks for VerifyBeforeDelete {
        async fn before_delete(
            &self,
            inner: &dyn RecordStore,
            table: &str,
            id: &str,
        ) -> HubResult<()> {
            if table == tables::MATCH_CANDIDATES {
                inner
                    .update(table, id, patch(json!({"status": "verified", "is_verified": true})))
                    .await?;
                inner
                    .increment(tables::EVENT_USERS, "u1", "matches_found", 1)
                    .await?;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_erase_uses_state_at_delete() {
        let f = fixture().await;
        candidate(&f.store, "c1", "u1", 0.9).await;
        let verifier = MatchVerifier::new(
            Arc::new(HookedStore::new(f.store.clone(), VerifyBeforeDelete)),
            FanOut::new(f.notifier.clone()),
        );

        assert!(verifier.erase("c1").await.unwrap());
        assert_eq!(matches_found(&f.store, "u1").await, 0);
        assert!(!verifier.erase("c1").await.unwrap());
    }

    #[tokio::test]
    async fn test_withdraw_photo_matches_gives_back_counters() {
        let f = fixture().await;
        candidate(&f.store, "c1", "u1", 0.9).await;
        candidate(&f.store, "c2", "u2", 0.8).await;
        candidate(&f.store, "c3", "u2", 0.7).await;
        f.verifier.verify("c1", "op-1").await.unwrap();
        f.verifier.verify("c2", "op-1").await.unwrap();

        assert_eq!(withdraw_photo_matches(f.store.as_ref(), "p1").await.unwrap(), 2);
        assert_eq!(matches_found(&f.store, "u1").await, 0);
        assert_eq!(matches_found(&f.store, "u2").await, 0);
        assert_eq!(f.verifier.list_unverified(10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_verify_without_registered_user() {
        let f = fixture().await;
        candidate(&f.store, "c1", "ghost", 0.9).await;
        let verified = f.verifier.verify("c1", "op-1").await.unwrap();
        assert!(verified.is_verified);
    }
}
