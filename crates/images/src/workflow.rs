//! The detection-image lifecycle state machine.

use std::collections::HashMap;
use std::sync::Mutex;

use xrbridge_events::{AnchorId, AnchorSnapshot, AuthorizationTier, DetectionImageDescriptor};

use crate::{ImageError, Result};

/// Completion for a create request.
pub type CreateCompletion = Box<dyn FnOnce(Result<()>) + Send>;

/// Completion for an activate (or reactivate-after-removal) request.
/// Resolves with the anchor snapshot once the sensor detects the image.
pub type ActivateCompletion = Box<dyn FnOnce(Result<AnchorSnapshot>) + Send>;

/// Lifecycle of one registered detection image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageLifecycle {
    /// Registered but not in the sensor's detection set.
    Created,
    /// In the detection set, waiting for the sensor to find it.
    ActivationPending,
    /// Detected; a live anchor exists for it.
    Active,
    /// Detected image whose anchor removal was requested so it can be
    /// detected again; a reactivation completion is stashed.
    DeactivationPending,
}

/// Something the session bridge must do on the sensor after a workflow
/// operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageAction {
    /// Re-run the session configuration with the current detection set.
    UpdateDetectionSet,
    /// Ask the sensor to remove this anchor to force re-detection.
    RemoveAnchor(AnchorId),
}

struct ImageEntry {
    descriptor: DetectionImageDescriptor,
    lifecycle: ImageLifecycle,
    /// Live anchor for this image while detected.
    anchor: Option<AnchorId>,
}

#[derive(Default)]
struct WorkflowInner {
    images: HashMap<String, ImageEntry>,
    /// Creations buffered while the tier is still undetermined, replayed or
    /// denied on the next tier transition.
    queued_creations: Vec<(DetectionImageDescriptor, CreateCompletion)>,
    activations: HashMap<String, ActivateCompletion>,
    reactivations: HashMap<String, ActivateCompletion>,
}

impl WorkflowInner {
    fn queued_name(&self, name: &str) -> bool {
        self.queued_creations.iter().any(|(d, _)| d.name == name)
    }
}

/// State machine for creating, activating, deactivating, and destroying
/// trackable reference images.
#[derive(Default)]
pub struct DetectionImageWorkflow {
    inner: Mutex<WorkflowInner>,
}

impl DetectionImageWorkflow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new detection image.
    ///
    /// Succeeds immediately at a world-sensing tier. While the tier is
    /// `NotDetermined` the request is queued and replayed automatically once
    /// the tier rises; at any restricted tier it fails with a denial.
    pub fn create(
        &self,
        descriptor: DetectionImageDescriptor,
        tier: AuthorizationTier,
        completion: CreateCompletion,
    ) {
        enum Outcome {
            Resolve(Result<()>, CreateCompletion),
            Queued,
        }

        let outcome = {
            let mut inner = self.inner.lock().expect("image workflow mutex poisoned");
            if descriptor.pixels.len() != descriptor.expected_len() {
                Outcome::Resolve(
                    Err(ImageError::InvalidBuffer {
                        expected: descriptor.expected_len(),
                        actual: descriptor.pixels.len(),
                    }),
                    completion,
                )
            } else if inner.images.contains_key(&descriptor.name)
                || inner.queued_name(&descriptor.name)
            {
                Outcome::Resolve(
                    Err(ImageError::DuplicateName(descriptor.name.clone())),
                    completion,
                )
            } else if tier.grants_world_sensing() {
                tracing::debug!(name = %descriptor.name, "detection image created");
                inner.images.insert(
                    descriptor.name.clone(),
                    ImageEntry {
                        descriptor,
                        lifecycle: ImageLifecycle::Created,
                        anchor: None,
                    },
                );
                Outcome::Resolve(Ok(()), completion)
            } else if tier == AuthorizationTier::NotDetermined {
                tracing::debug!(name = %descriptor.name, "queueing detection image until authorization is determined");
                inner.queued_creations.push((descriptor, completion));
                Outcome::Queued
            } else {
                Outcome::Resolve(Err(ImageError::PermissionDenied), completion)
            }
        };
        if let Outcome::Resolve(result, completion) = outcome {
            completion(result);
        }
    }

    /// Replay creations queued while the tier was undetermined. Called when
    /// authorization rises into a world-sensing tier.
    pub fn replay_queued_creations(&self) {
        let completions = {
            let mut inner = self.inner.lock().expect("image workflow mutex poisoned");
            let queued = std::mem::take(&mut inner.queued_creations);
            let mut completions = Vec::with_capacity(queued.len());
            for (descriptor, completion) in queued {
                tracing::debug!(name = %descriptor.name, "replaying queued detection image creation");
                inner.images.insert(
                    descriptor.name.clone(),
                    ImageEntry {
                        descriptor,
                        lifecycle: ImageLifecycle::Created,
                        anchor: None,
                    },
                );
                completions.push(completion);
            }
            completions
        };
        for completion in completions {
            completion(Ok(()));
        }
    }

    /// Deny creations queued while the tier was undetermined, exactly once
    /// each. Called when authorization drops to a restricted tier.
    pub fn deny_queued_creations(&self) {
        let completions = {
            let mut inner = self.inner.lock().expect("image workflow mutex poisoned");
            std::mem::take(&mut inner.queued_creations)
        };
        for (descriptor, completion) in completions {
            tracing::debug!(name = %descriptor.name, "denying queued detection image creation");
            completion(Err(ImageError::PermissionDenied));
        }
    }

    /// Request activation of a previously created image.
    ///
    /// Exactly one activation-family completion may be outstanding per name:
    /// a second activate while the first is still searching fails with
    /// [`ImageError::AlreadyActivating`] and leaves the original completion
    /// intact. Activating an image that is already detected removes its live
    /// anchor to force re-detection and stashes the caller's completion
    /// until the sensor reports that anchor removed.
    pub fn activate(
        &self,
        name: &str,
        face_tracking: bool,
        completion: ActivateCompletion,
    ) -> Option<ImageAction> {
        // Failures carry the completion back out of the critical section so
        // it is always resolved outside the lock.
        enum Outcome {
            Fail(ImageError, ActivateCompletion),
            Stashed(ImageAction),
        }

        let outcome = {
            let mut inner = self.inner.lock().expect("image workflow mutex poisoned");
            if face_tracking {
                Outcome::Fail(ImageError::FrontCamera, completion)
            } else {
                match inner.images.get(name).map(|e| (e.lifecycle, e.anchor)) {
                    None => Outcome::Fail(ImageError::NotFound(name.to_string()), completion),
                    Some((ImageLifecycle::Created, _)) => {
                        let entry = inner.images.get_mut(name).expect("entry present");
                        entry.lifecycle = ImageLifecycle::ActivationPending;
                        debug_assert!(!inner.reactivations.contains_key(name));
                        inner.activations.insert(name.to_string(), completion);
                        Outcome::Stashed(ImageAction::UpdateDetectionSet)
                    }
                    Some((ImageLifecycle::ActivationPending, _))
                    | Some((ImageLifecycle::DeactivationPending, _)) => {
                        // Keep the original completion; only this call fails.
                        Outcome::Fail(ImageError::AlreadyActivating, completion)
                    }
                    Some((ImageLifecycle::Active, Some(anchor))) => {
                        let entry = inner.images.get_mut(name).expect("entry present");
                        entry.lifecycle = ImageLifecycle::DeactivationPending;
                        debug_assert!(!inner.activations.contains_key(name));
                        inner.reactivations.insert(name.to_string(), completion);
                        Outcome::Stashed(ImageAction::RemoveAnchor(anchor))
                    }
                    Some((ImageLifecycle::Active, None)) => {
                        // Detected state without an anchor violates the
                        // sensor contract; fall back to a fresh search.
                        tracing::warn!(name, "active detection image has no live anchor");
                        let entry = inner.images.get_mut(name).expect("entry present");
                        entry.lifecycle = ImageLifecycle::ActivationPending;
                        inner.activations.insert(name.to_string(), completion);
                        Outcome::Stashed(ImageAction::UpdateDetectionSet)
                    }
                }
            }
        };
        match outcome {
            Outcome::Fail(error, completion) => {
                completion(Err(error));
                None
            }
            Outcome::Stashed(action) => Some(action),
        }
    }

    /// Remove an image from the detection set.
    ///
    /// If an activation completion is still outstanding it resolves with
    /// [`ImageError::DeactivatedBeforeFound`], exactly once, before the
    /// deactivation proceeds.
    pub fn deactivate(&self, name: &str, face_tracking: bool) -> Result<ImageAction> {
        let (result, pending) = {
            let mut inner = self.inner.lock().expect("image workflow mutex poisoned");
            if face_tracking {
                (Err(ImageError::FrontCamera), Vec::new())
            } else {
                match inner.images.get(name).map(|e| e.lifecycle) {
                    None => (Err(ImageError::NotFound(name.to_string())), Vec::new()),
                    Some(ImageLifecycle::Created) => {
                        (Err(ImageError::NotActive(name.to_string())), Vec::new())
                    }
                    Some(_) => {
                        let entry = inner.images.get_mut(name).expect("entry present");
                        entry.lifecycle = ImageLifecycle::Created;
                        entry.anchor = None;
                        let mut pending = Vec::new();
                        if let Some(completion) = inner.activations.remove(name) {
                            pending.push(completion);
                        }
                        if let Some(completion) = inner.reactivations.remove(name) {
                            pending.push(completion);
                        }
                        (Ok(ImageAction::UpdateDetectionSet), pending)
                    }
                }
            }
        };
        for completion in pending {
            completion(Err(ImageError::DeactivatedBeforeFound));
        }
        result
    }

    /// Purge the descriptor and any pending completions for this name.
    pub fn destroy(&self, name: &str) -> Result<()> {
        let (result, pending_activations, pending_creation) = {
            let mut inner = self.inner.lock().expect("image workflow mutex poisoned");
            let mut pending = Vec::new();
            if let Some(completion) = inner.activations.remove(name) {
                pending.push(completion);
            }
            if let Some(completion) = inner.reactivations.remove(name) {
                pending.push(completion);
            }
            if inner.images.remove(name).is_some() {
                (Ok(()), pending, None)
            } else if let Some(pos) = inner
                .queued_creations
                .iter()
                .position(|(d, _)| d.name == name)
            {
                let (_, completion) = inner.queued_creations.remove(pos);
                (Ok(()), pending, Some(completion))
            } else {
                (Err(ImageError::NotFound(name.to_string())), pending, None)
            }
        };
        for completion in pending_activations {
            completion(Err(ImageError::Destroyed));
        }
        if let Some(completion) = pending_creation {
            completion(Err(ImageError::Destroyed));
        }
        result
    }

    /// The sensor detected this image and created an anchor for it.
    /// Resolves the outstanding activation completion, if any.
    pub fn on_image_anchor_added(&self, name: &str, snapshot: AnchorSnapshot) {
        let completion = {
            let mut inner = self.inner.lock().expect("image workflow mutex poisoned");
            match inner.images.get_mut(name) {
                Some(entry) => {
                    entry.lifecycle = ImageLifecycle::Active;
                    entry.anchor = Some(snapshot.id);
                    inner.activations.remove(name)
                }
                None => {
                    tracing::warn!(name, "anchor added for an unknown detection image");
                    None
                }
            }
        };
        if let Some(completion) = completion {
            completion(Ok(snapshot));
        }
    }

    /// The sensor removed the anchor for this image.
    ///
    /// If a reactivate-after-removal completion is stashed, the image goes
    /// straight back into the detection set and the completion becomes the
    /// new activation completion; it resolves when the image is found again.
    pub fn on_image_anchor_removed(&self, name: &str) -> Option<ImageAction> {
        let mut inner = self.inner.lock().expect("image workflow mutex poisoned");
        let entry = inner.images.get_mut(name)?;
        entry.anchor = None;
        if entry.lifecycle == ImageLifecycle::Created {
            return None;
        }
        entry.lifecycle = ImageLifecycle::ActivationPending;
        if let Some(completion) = inner.reactivations.remove(name) {
            debug_assert!(!inner.activations.contains_key(name));
            inner.activations.insert(name.to_string(), completion);
            Some(ImageAction::UpdateDetectionSet)
        } else {
            None
        }
    }

    /// Names currently in the sensor's detection set.
    pub fn detection_set(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("image workflow mutex poisoned");
        let mut names: Vec<String> = inner
            .images
            .iter()
            .filter(|(_, e)| {
                matches!(
                    e.lifecycle,
                    ImageLifecycle::ActivationPending | ImageLifecycle::Active
                )
            })
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Descriptors for the current detection set, for configuration rebuild.
    pub fn detection_descriptors(&self) -> Vec<DetectionImageDescriptor> {
        let inner = self.inner.lock().expect("image workflow mutex poisoned");
        inner
            .images
            .values()
            .filter(|e| {
                matches!(
                    e.lifecycle,
                    ImageLifecycle::ActivationPending | ImageLifecycle::Active
                )
            })
            .map(|e| e.descriptor.clone())
            .collect()
    }

    pub fn lifecycle(&self, name: &str) -> Option<ImageLifecycle> {
        let inner = self.inner.lock().expect("image workflow mutex poisoned");
        inner.images.get(name).map(|e| e.lifecycle)
    }

    /// Outstanding completion slots for a name: (activation, reactivation).
    /// At most one of the two may be set at any instant.
    pub fn outstanding_slots(&self, name: &str) -> (bool, bool) {
        let inner = self.inner.lock().expect("image workflow mutex poisoned");
        (
            inner.activations.contains_key(name),
            inner.reactivations.contains_key(name),
        )
    }

    /// Number of creations still queued behind an undetermined tier.
    pub fn queued_creation_count(&self) -> usize {
        let inner = self.inner.lock().expect("image workflow mutex poisoned");
        inner.queued_creations.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use xrbridge_events::IDENTITY_TRANSFORM;

    fn descriptor(name: &str) -> DetectionImageDescriptor {
        DetectionImageDescriptor {
            name: name.to_string(),
            pixels: vec![0; 16],
            width: 2,
            height: 2,
            physical_width_m: 0.2,
        }
    }

    fn snapshot(name: &str) -> AnchorSnapshot {
        AnchorSnapshot {
            id: xrbridge_events::AnchorId::new(),
            kind: xrbridge_events::AnchorKind::Image,
            transform: IDENTITY_TRANSFORM,
            extent: None,
            center: None,
            image_name: Some(name.to_string()),
            user_anchor_id: None,
        }
    }

    fn create_ok(workflow: &DetectionImageWorkflow, name: &str) {
        let (tx, rx) = mpsc::channel();
        workflow.create(
            descriptor(name),
            AuthorizationTier::WorldSensing,
            Box::new(move |r| tx.send(r).unwrap()),
        );
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
    }

    #[test]
    fn test_create_denied_below_world_sensing() {
        let workflow = DetectionImageWorkflow::new();
        let (tx, rx) = mpsc::channel();
        workflow.create(
            descriptor("m"),
            AuthorizationTier::Lite,
            Box::new(move |r| tx.send(r).unwrap()),
        );
        assert_eq!(rx.try_recv().unwrap(), Err(ImageError::PermissionDenied));
    }

    #[test]
    fn test_create_queued_while_not_determined_then_replayed() {
        let workflow = DetectionImageWorkflow::new();
        let (tx, rx) = mpsc::channel();
        workflow.create(
            descriptor("m"),
            AuthorizationTier::NotDetermined,
            Box::new(move |r| tx.send(r).unwrap()),
        );
        // Pending, not denied.
        assert!(rx.try_recv().is_err());
        assert_eq!(workflow.queued_creation_count(), 1);

        workflow.replay_queued_creations();
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
        assert_eq!(workflow.lifecycle("m"), Some(ImageLifecycle::Created));
        assert_eq!(workflow.queued_creation_count(), 0);
    }

    #[test]
    fn test_queued_creation_denied_exactly_once_on_downgrade() {
        let workflow = DetectionImageWorkflow::new();
        let (tx, rx) = mpsc::channel();
        workflow.create(
            descriptor("m"),
            AuthorizationTier::NotDetermined,
            Box::new(move |r| tx.send(r).unwrap()),
        );
        workflow.deny_queued_creations();
        assert_eq!(rx.try_recv().unwrap(), Err(ImageError::PermissionDenied));
        // A second walk must not fire anything again.
        workflow.deny_queued_creations();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_create_rejects_bad_buffer_and_duplicates() {
        let workflow = DetectionImageWorkflow::new();
        let mut bad = descriptor("m");
        bad.pixels = vec![0; 3];
        let (tx, rx) = mpsc::channel();
        workflow.create(
            bad,
            AuthorizationTier::WorldSensing,
            Box::new(move |r| tx.send(r).unwrap()),
        );
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(ImageError::InvalidBuffer { .. })
        ));

        create_ok(&workflow, "m");
        let (tx, rx) = mpsc::channel();
        workflow.create(
            descriptor("m"),
            AuthorizationTier::WorldSensing,
            Box::new(move |r| tx.send(r).unwrap()),
        );
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(ImageError::DuplicateName(_))
        ));
    }

    #[test]
    fn test_activate_unknown_and_front_camera() {
        let workflow = DetectionImageWorkflow::new();
        let (tx, rx) = mpsc::channel();
        let action = workflow.activate("nope", false, Box::new(move |r| tx.send(r).unwrap()));
        assert_eq!(action, None);
        assert_eq!(
            rx.try_recv().unwrap(),
            Err(ImageError::NotFound("nope".into()))
        );

        create_ok(&workflow, "m");
        let (tx, rx) = mpsc::channel();
        let action = workflow.activate("m", true, Box::new(move |r| tx.send(r).unwrap()));
        assert_eq!(action, None);
        assert_eq!(rx.try_recv().unwrap(), Err(ImageError::FrontCamera));
    }

    #[test]
    fn test_second_activate_fails_and_keeps_original_completion() {
        let workflow = DetectionImageWorkflow::new();
        create_ok(&workflow, "m");

        let (tx1, rx1) = mpsc::channel();
        let action = workflow.activate("m", false, Box::new(move |r| tx1.send(r).unwrap()));
        assert_eq!(action, Some(ImageAction::UpdateDetectionSet));
        assert_eq!(workflow.detection_set(), vec!["m".to_string()]);

        let (tx2, rx2) = mpsc::channel();
        let action = workflow.activate("m", false, Box::new(move |r| tx2.send(r).unwrap()));
        assert_eq!(action, None);
        assert_eq!(rx2.try_recv().unwrap(), Err(ImageError::AlreadyActivating));

        // Original completion is intact and resolves on detection.
        workflow.on_image_anchor_added("m", snapshot("m"));
        assert!(rx1.try_recv().unwrap().is_ok());
        assert_eq!(workflow.lifecycle("m"), Some(ImageLifecycle::Active));
    }

    #[test]
    fn test_reactivation_after_removal() {
        let workflow = DetectionImageWorkflow::new();
        create_ok(&workflow, "m");

        let (tx, rx) = mpsc::channel();
        workflow.activate("m", false, Box::new(move |r| tx.send(r).unwrap()));
        let detected = snapshot("m");
        let anchor_id = detected.id;
        workflow.on_image_anchor_added("m", detected);
        assert!(rx.try_recv().unwrap().is_ok());

        // Second activate while detected: anchor removal is requested and
        // the completion is deferred.
        let (tx2, rx2) = mpsc::channel();
        let action = workflow.activate("m", false, Box::new(move |r| tx2.send(r).unwrap()));
        assert_eq!(action, Some(ImageAction::RemoveAnchor(anchor_id)));
        assert_eq!(
            workflow.lifecycle("m"),
            Some(ImageLifecycle::DeactivationPending)
        );
        let (activation, reactivation) = workflow.outstanding_slots("m");
        assert!(!activation && reactivation, "only the reactivation slot may be set");
        assert!(rx2.try_recv().is_err(), "completion must stay pending");

        // Hardware reports the anchor removed: back into the detection set.
        let action = workflow.on_image_anchor_removed("m");
        assert_eq!(action, Some(ImageAction::UpdateDetectionSet));
        let (activation, reactivation) = workflow.outstanding_slots("m");
        assert!(activation && !reactivation, "slot moved to activation");

        // Fresh detection resolves the deferred completion with success.
        workflow.on_image_anchor_added("m", snapshot("m"));
        let outcome = rx2.try_recv().unwrap();
        assert!(outcome.is_ok());
        assert_eq!(outcome.unwrap().image_name.as_deref(), Some("m"));
    }

    #[test]
    fn test_deactivate_resolves_outstanding_activation_once() {
        let workflow = DetectionImageWorkflow::new();
        create_ok(&workflow, "m");
        let (tx, rx) = mpsc::channel();
        workflow.activate("m", false, Box::new(move |r| tx.send(r).unwrap()));

        let result = workflow.deactivate("m", false);
        assert_eq!(result, Ok(ImageAction::UpdateDetectionSet));
        assert_eq!(
            rx.try_recv().unwrap(),
            Err(ImageError::DeactivatedBeforeFound)
        );
        assert!(rx.try_recv().is_err(), "completion fired exactly once");
        assert_eq!(workflow.lifecycle("m"), Some(ImageLifecycle::Created));

        // Not in the active set anymore.
        assert_eq!(
            workflow.deactivate("m", false),
            Err(ImageError::NotActive("m".into()))
        );
    }

    #[test]
    fn test_deactivate_on_face_tracking_fails() {
        let workflow = DetectionImageWorkflow::new();
        create_ok(&workflow, "m");
        assert_eq!(workflow.deactivate("m", true), Err(ImageError::FrontCamera));
    }

    #[test]
    fn test_destroy_purges_descriptor_and_completions() {
        let workflow = DetectionImageWorkflow::new();
        assert_eq!(
            workflow.destroy("nope"),
            Err(ImageError::NotFound("nope".into()))
        );

        create_ok(&workflow, "m");
        let (tx, rx) = mpsc::channel();
        workflow.activate("m", false, Box::new(move |r| tx.send(r).unwrap()));

        assert_eq!(workflow.destroy("m"), Ok(()));
        assert_eq!(rx.try_recv().unwrap(), Err(ImageError::Destroyed));
        assert_eq!(workflow.lifecycle("m"), None);
    }

    #[test]
    fn test_destroy_queued_creation_resolves_completion() {
        let workflow = DetectionImageWorkflow::new();
        let (tx, rx) = mpsc::channel();
        workflow.create(
            descriptor("m"),
            AuthorizationTier::NotDetermined,
            Box::new(move |r| tx.send(r).unwrap()),
        );
        assert_eq!(workflow.destroy("m"), Ok(()));
        assert_eq!(rx.try_recv().unwrap(), Err(ImageError::Destroyed));
        assert_eq!(workflow.queued_creation_count(), 0);
    }
}
