//! The canonical anchor map and per-frame diff buffers.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use xrbridge_auth::AuthorizationPolicy;
use xrbridge_events::{AnchorId, AnchorKind, AnchorSnapshot, AuthorizationTier};

use crate::record::AnchorRecord;

/// Added/removed anchors since the last published frame.
///
/// Drained on read; never persisted across frames.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameDiff {
    pub added: Vec<AnchorSnapshot>,
    pub removed: Vec<AnchorId>,
}

impl FrameDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Session context the registration rule depends on.
#[derive(Debug, Clone, Copy, Default)]
pub struct IngestContext {
    /// Whether the active configuration tracks faces (front camera).
    pub face_tracking: bool,
    /// Number of plane anchors currently present in the live frame,
    /// including undisclosed ones. Drives the Lite single-plane rule.
    pub live_plane_count: usize,
}

#[derive(Default)]
struct RegistryInner {
    objects: BTreeMap<AnchorId, AnchorSnapshot>,
    added: Vec<AnchorSnapshot>,
    removed: Vec<AnchorId>,
    /// Hardware anchor id -> external id supplied by the web page.
    user_ids: HashMap<AnchorId, String>,
}

/// Canonical map from anchor identity to its disclosed representation.
///
/// All mutation happens under one mutex; lock scopes never span callback
/// invocations.
#[derive(Default)]
pub struct AnchorRegistry {
    inner: Mutex<RegistryInner>,
}

impl AnchorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register anchors that qualify for disclosure under the current
    /// policy. Returns the ids that were newly registered.
    ///
    /// Face anchors delivered while the configuration is not face-tracking
    /// violate the sensor contract: they are logged and skipped, never
    /// registered.
    pub fn ingest_added(
        &self,
        records: &[AnchorRecord],
        policy: &AuthorizationPolicy,
        ctx: IngestContext,
    ) -> Vec<AnchorId> {
        let mut inner = self.inner.lock().expect("anchor registry mutex poisoned");
        let mut registered = Vec::new();
        for record in records {
            if record.kind() == AnchorKind::Face && !ctx.face_tracking {
                tracing::warn!(id = %record.id, "face anchor delivered without a face-tracking configuration, rejecting");
                continue;
            }
            if inner.objects.contains_key(&record.id) {
                continue;
            }
            if !Self::qualifies(record, policy, ctx) {
                continue;
            }
            let user_anchor_id = inner.user_ids.get(&record.id).cloned();
            let snapshot = record.snapshot(user_anchor_id);
            inner.objects.insert(record.id, snapshot.clone());
            inner.added.push(snapshot);
            registered.push(record.id);
        }
        registered
    }

    /// The registration rule: per-kind disclosure, individual approval, or
    /// the Lite single-plane exception (exactly one plane in the live
    /// frame, no more).
    fn qualifies(record: &AnchorRecord, policy: &AuthorizationPolicy, ctx: IngestContext) -> bool {
        if policy.is_disclosed(record.kind()) || policy.is_anchor_approved(&record.id) {
            return true;
        }
        policy.tier() == AuthorizationTier::Lite
            && record.kind() == AnchorKind::Plane
            && ctx.live_plane_count == 1
    }

    /// Refresh the snapshots of already-registered anchors in place.
    /// Updates never enter the diff buffers.
    pub fn ingest_updated(&self, records: &[AnchorRecord], ctx: IngestContext) {
        let mut inner = self.inner.lock().expect("anchor registry mutex poisoned");
        for record in records {
            if record.kind() == AnchorKind::Face && !ctx.face_tracking {
                tracing::warn!(id = %record.id, "face anchor update without a face-tracking configuration, rejecting");
                continue;
            }
            let user_anchor_id = inner.user_ids.get(&record.id).cloned();
            if let Some(snapshot) = inner.objects.get_mut(&record.id) {
                *snapshot = record.snapshot(user_anchor_id);
            }
        }
    }

    /// Remove registered anchors, queueing them into the removed diff.
    /// Removing an anchor that was never registered is a no-op.
    /// Returns the ids that were actually removed.
    pub fn ingest_removed(&self, ids: &[AnchorId]) -> Vec<AnchorId> {
        let mut inner = self.inner.lock().expect("anchor registry mutex poisoned");
        let mut dropped = Vec::new();
        for id in ids {
            if inner.objects.remove(id).is_some() {
                inner.removed.push(*id);
                inner.user_ids.remove(id);
                dropped.push(*id);
            } else if inner.user_ids.remove(id).is_some() {
                tracing::debug!(%id, "removed anchor was mapped to a user id but never registered");
            }
        }
        dropped
    }

    /// Drain the diff buffers. A second call with no intervening hardware
    /// events returns an empty diff.
    pub fn snapshot_diff(&self) -> FrameDiff {
        let mut inner = self.inner.lock().expect("anchor registry mutex poisoned");
        FrameDiff {
            added: std::mem::take(&mut inner.added),
            removed: std::mem::take(&mut inner.removed),
        }
    }

    /// Copy of the current canonical map for frame publishing.
    pub fn objects(&self) -> BTreeMap<AnchorId, AnchorSnapshot> {
        self.inner
            .lock()
            .expect("anchor registry mutex poisoned")
            .objects
            .clone()
    }

    pub fn contains(&self, id: &AnchorId) -> bool {
        self.inner
            .lock()
            .expect("anchor registry mutex poisoned")
            .objects
            .contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("anchor registry mutex poisoned")
            .objects
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Full discard: canonical map, diff buffers, and user-id mapping.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("anchor registry mutex poisoned");
        inner.objects.clear();
        inner.added.clear();
        inner.removed.clear();
        inner.user_ids.clear();
    }

    /// Associate a hardware anchor with the external id the page supplied.
    pub fn set_user_id(&self, id: AnchorId, user_id: impl Into<String>) {
        let mut inner = self.inner.lock().expect("anchor registry mutex poisoned");
        let user_id = user_id.into();
        if let Some(snapshot) = inner.objects.get_mut(&id) {
            snapshot.user_anchor_id = Some(user_id.clone());
        }
        inner.user_ids.insert(id, user_id);
    }

    /// Reverse lookup: hardware anchor id for an external user id.
    pub fn anchor_for_user_id(&self, user_id: &str) -> Option<AnchorId> {
        let inner = self.inner.lock().expect("anchor registry mutex poisoned");
        inner
            .user_ids
            .iter()
            .find(|(_, v)| v.as_str() == user_id)
            .map(|(k, _)| *k)
    }

    /// Clear the external-anchor-id mapping; called whenever anchors are
    /// removed as part of a session (re)start.
    pub fn clear_user_ids(&self) {
        self.inner
            .lock()
            .expect("anchor registry mutex poisoned")
            .user_ids
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xrbridge_events::IDENTITY_TRANSFORM;

    fn plane() -> AnchorRecord {
        AnchorRecord::plane(AnchorId::new(), IDENTITY_TRANSFORM, [1.0, 1.0], [0.0; 3])
    }

    fn world_sensing_policy() -> AuthorizationPolicy {
        let mut policy = AuthorizationPolicy::new();
        policy.set_tier(AuthorizationTier::WorldSensing);
        policy
    }

    #[test]
    fn test_registration_gated_by_tier() {
        let registry = AnchorRegistry::new();
        let mut policy = AuthorizationPolicy::new();
        policy.set_tier(AuthorizationTier::Minimal);

        let record = plane();
        let registered = registry.ingest_added(
            &[record.clone()],
            &policy,
            IngestContext {
                live_plane_count: 2,
                ..Default::default()
            },
        );
        assert!(registered.is_empty());
        assert!(!registry.contains(&record.id));

        policy.set_tier(AuthorizationTier::WorldSensing);
        let registered = registry.ingest_added(&[record.clone()], &policy, IngestContext::default());
        assert_eq!(registered, vec![record.id]);
        assert!(registry.contains(&record.id));
    }

    #[test]
    fn test_lite_single_plane_rule_requires_exactly_one() {
        let mut policy = AuthorizationPolicy::new();
        policy.set_tier(AuthorizationTier::Lite);

        // Exactly one plane: force-registered.
        let registry = AnchorRegistry::new();
        let sole = plane();
        let ctx = IngestContext {
            live_plane_count: 1,
            ..Default::default()
        };
        assert_eq!(registry.ingest_added(&[sole.clone()], &policy, ctx).len(), 1);

        // Two planes: neither qualifies.
        let registry = AnchorRegistry::new();
        let ctx = IngestContext {
            live_plane_count: 2,
            ..Default::default()
        };
        let registered = registry.ingest_added(&[plane(), plane()], &policy, ctx);
        assert!(registered.is_empty());

        // Three planes: still none.
        let registry = AnchorRegistry::new();
        let ctx = IngestContext {
            live_plane_count: 3,
            ..Default::default()
        };
        let registered = registry.ingest_added(&[plane(), plane(), plane()], &policy, ctx);
        assert!(registered.is_empty());
    }

    #[test]
    fn test_face_anchor_rejected_without_face_tracking() {
        let registry = AnchorRegistry::new();
        let policy = world_sensing_policy();
        let face = AnchorRecord::face(AnchorId::new(), IDENTITY_TRANSFORM);

        let registered = registry.ingest_added(&[face.clone()], &policy, IngestContext::default());
        assert!(registered.is_empty());

        let ctx = IngestContext {
            face_tracking: true,
            ..Default::default()
        };
        let registered = registry.ingest_added(&[face], &policy, ctx);
        assert_eq!(registered.len(), 1);
    }

    #[test]
    fn test_diff_drained_on_read() {
        let registry = AnchorRegistry::new();
        let policy = world_sensing_policy();
        let record = plane();
        registry.ingest_added(&[record.clone()], &policy, IngestContext::default());

        let diff = registry.snapshot_diff();
        assert_eq!(diff.added.len(), 1);
        assert!(diff.removed.is_empty());

        // Idempotence: second read with no intervening events is empty.
        assert!(registry.snapshot_diff().is_empty());

        registry.ingest_removed(&[record.id]);
        let diff = registry.snapshot_diff();
        assert!(diff.added.is_empty());
        assert_eq!(diff.removed, vec![record.id]);
        assert!(registry.snapshot_diff().is_empty());
    }

    #[test]
    fn test_remove_unregistered_is_noop() {
        let registry = AnchorRegistry::new();
        let dropped = registry.ingest_removed(&[AnchorId::new()]);
        assert!(dropped.is_empty());
        assert!(registry.snapshot_diff().is_empty());
    }

    #[test]
    fn test_update_refreshes_without_diff() {
        let registry = AnchorRegistry::new();
        let policy = world_sensing_policy();
        let mut record = plane();
        registry.ingest_added(&[record.clone()], &policy, IngestContext::default());
        registry.snapshot_diff();

        record.transform[12] = 3.0;
        registry.ingest_updated(&[record.clone()], IngestContext::default());

        assert!(registry.snapshot_diff().is_empty());
        let objects = registry.objects();
        assert_eq!(objects[&record.id].transform[12], 3.0);
    }

    #[test]
    fn test_user_id_mapping() {
        let registry = AnchorRegistry::new();
        let policy = world_sensing_policy();
        let record = AnchorRecord::user(AnchorId::new(), IDENTITY_TRANSFORM);

        registry.set_user_id(record.id, "page-anchor-1");
        registry.ingest_added(&[record.clone()], &policy, IngestContext::default());

        let objects = registry.objects();
        assert_eq!(
            objects[&record.id].user_anchor_id.as_deref(),
            Some("page-anchor-1")
        );
        assert_eq!(registry.anchor_for_user_id("page-anchor-1"), Some(record.id));

        registry.clear_user_ids();
        assert_eq!(registry.anchor_for_user_id("page-anchor-1"), None);
    }

    #[test]
    fn test_clear_discards_everything() {
        let registry = AnchorRegistry::new();
        let policy = world_sensing_policy();
        registry.ingest_added(&[plane(), plane()], &policy, IngestContext::default());

        registry.clear();
        assert!(registry.is_empty());
        assert!(registry.snapshot_diff().is_empty());
    }
}
