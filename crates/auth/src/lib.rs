//! Tiered authorization policy over what sensing data may be disclosed.
//!
//! The policy owns the current disclosure tier and turns tier transitions
//! into explicit [`PolicyIntent`] values. It never touches I/O or the anchor
//! registry itself; the session bridge executes the intents. This keeps the
//! transition rules testable in isolation and guarantees that pending
//! requests are either serviced or denied deterministically, never left
//! dangling.

use std::collections::HashSet;

use xrbridge_events::{AnchorId, AnchorKind, AuthorizationTier};

/// A side effect the session bridge must execute after a tier transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyIntent {
    /// Register every live anchor not yet in the registry and mark it added,
    /// so nothing that existed before authorization is silently skipped.
    ResyncLiveAnchors,
    /// Register only live anchors that individually qualify under the new
    /// restricted tier; already-registered anchors are kept.
    RegisterQualifyingAnchors,
    /// Discard the entire registry; disclosure context is void.
    ClearRegistry,
    /// Replay detection-image creations queued while undetermined.
    ReplayQueuedImageCreations,
    /// Deny queued detection-image creations, exactly once each.
    DenyQueuedImageCreations,
    /// Service a pending world-map retrieval request immediately.
    ServicePendingWorldMap,
    /// Fail a pending world-map retrieval request with a denial.
    DenyPendingWorldMap,
}

/// Holds the current disclosure tier and validates transitions.
#[derive(Debug, Clone)]
pub struct AuthorizationPolicy {
    tier: AuthorizationTier,
    /// Highest tier the user has granted this site; requests are clamped
    /// to it.
    user_grant: AuthorizationTier,
    /// Anchors individually approved by the user (e.g. the single plane
    /// confirmed in Lite mode).
    approved_anchors: HashSet<AnchorId>,
}

impl Default for AuthorizationPolicy {
    fn default() -> Self {
        Self {
            tier: AuthorizationTier::NotDetermined,
            user_grant: AuthorizationTier::VideoCameraAccess,
            approved_anchors: HashSet::new(),
        }
    }
}

impl AuthorizationPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tier(&self) -> AuthorizationTier {
        self.tier
    }

    /// Record the highest tier the user is willing to grant this site.
    pub fn set_user_grant(&mut self, grant: AuthorizationTier) {
        self.user_grant = grant;
    }

    /// The tier actually granted for a request: the requested tier clamped
    /// to the user's grant.
    pub fn max_tier_for(&self, requested: AuthorizationTier) -> AuthorizationTier {
        requested.min(self.user_grant)
    }

    /// Transition to a new tier, returning the intents the bridge must
    /// execute. Returns an empty set when the tier is unchanged.
    pub fn set_tier(&mut self, new: AuthorizationTier) -> Vec<PolicyIntent> {
        if new == self.tier {
            return Vec::new();
        }
        let old = self.tier;
        self.tier = new;
        tracing::debug!(?old, ?new, "authorization tier changed");

        match new {
            AuthorizationTier::NotDetermined => {
                vec![PolicyIntent::ClearRegistry]
            }
            AuthorizationTier::WorldSensing | AuthorizationTier::VideoCameraAccess => vec![
                PolicyIntent::ResyncLiveAnchors,
                PolicyIntent::ReplayQueuedImageCreations,
                PolicyIntent::ServicePendingWorldMap,
            ],
            AuthorizationTier::Lite | AuthorizationTier::Minimal | AuthorizationTier::Denied => {
                vec![
                    PolicyIntent::RegisterQualifyingAnchors,
                    PolicyIntent::DenyQueuedImageCreations,
                    PolicyIntent::DenyPendingWorldMap,
                ]
            }
        }
    }

    /// Whether anchors of `kind` are disclosed at the current tier.
    ///
    /// The Lite single-plane rule is not covered here: it depends on the
    /// live frame contents and is applied by the registry.
    pub fn is_disclosed(&self, kind: AnchorKind) -> bool {
        match self.tier {
            AuthorizationTier::WorldSensing | AuthorizationTier::VideoCameraAccess => true,
            // Lite discloses face anchors but no world geometry; a sole
            // plane can still qualify through the single-plane rule.
            AuthorizationTier::Lite => kind == AnchorKind::Face,
            AuthorizationTier::Minimal
            | AuthorizationTier::Denied
            | AuthorizationTier::NotDetermined => false,
        }
    }

    /// Mark one anchor as individually approved by the user.
    pub fn approve_anchor(&mut self, id: AnchorId) {
        self.approved_anchors.insert(id);
    }

    pub fn revoke_anchor(&mut self, id: &AnchorId) {
        self.approved_anchors.remove(id);
    }

    /// Whether this specific anchor was individually approved.
    pub fn is_anchor_approved(&self, id: &AnchorId) -> bool {
        self.approved_anchors.contains(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use AuthorizationTier::*;

    #[test]
    fn test_same_tier_is_noop() {
        let mut policy = AuthorizationPolicy::new();
        assert!(policy.set_tier(NotDetermined).is_empty());
    }

    #[test]
    fn test_rise_to_world_sensing_resyncs() {
        let mut policy = AuthorizationPolicy::new();
        let intents = policy.set_tier(WorldSensing);
        assert!(intents.contains(&PolicyIntent::ResyncLiveAnchors));
        assert!(intents.contains(&PolicyIntent::ReplayQueuedImageCreations));
        assert!(intents.contains(&PolicyIntent::ServicePendingWorldMap));
        assert_eq!(policy.tier(), WorldSensing);
    }

    #[test]
    fn test_drop_to_restricted_denies_pending() {
        let mut policy = AuthorizationPolicy::new();
        policy.set_tier(WorldSensing);
        let intents = policy.set_tier(Lite);
        assert!(intents.contains(&PolicyIntent::DenyPendingWorldMap));
        assert!(intents.contains(&PolicyIntent::RegisterQualifyingAnchors));
        assert!(!intents.contains(&PolicyIntent::ClearRegistry));
    }

    #[test]
    fn test_not_determined_clears_registry() {
        let mut policy = AuthorizationPolicy::new();
        policy.set_tier(VideoCameraAccess);
        let intents = policy.set_tier(NotDetermined);
        assert_eq!(intents, vec![PolicyIntent::ClearRegistry]);
    }

    #[test]
    fn test_disclosure_table() {
        let mut policy = AuthorizationPolicy::new();
        policy.set_tier(WorldSensing);
        assert!(policy.is_disclosed(AnchorKind::Plane));
        assert!(policy.is_disclosed(AnchorKind::Image));

        policy.set_tier(Lite);
        assert!(policy.is_disclosed(AnchorKind::Face));
        assert!(!policy.is_disclosed(AnchorKind::Plane));
        assert!(!policy.is_disclosed(AnchorKind::Image));

        policy.set_tier(Minimal);
        assert!(!policy.is_disclosed(AnchorKind::Face));
    }

    #[test]
    fn test_max_tier_clamped_to_user_grant() {
        let mut policy = AuthorizationPolicy::new();
        policy.set_user_grant(Lite);
        assert_eq!(policy.max_tier_for(VideoCameraAccess), Lite);
        assert_eq!(policy.max_tier_for(Minimal), Minimal);
    }

    #[test]
    fn test_anchor_approval() {
        let mut policy = AuthorizationPolicy::new();
        let id = AnchorId::new();
        assert!(!policy.is_anchor_approved(&id));
        policy.approve_anchor(id);
        assert!(policy.is_anchor_approved(&id));
        policy.revoke_anchor(&id);
        assert!(!policy.is_anchor_approved(&id));
    }
}
