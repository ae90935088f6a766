//! The session bridge itself.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use crossbeam_channel::{Receiver, Sender};
use serde_json::json;
use xrbridge_anchors::{AnchorRecord, AnchorRegistry, IngestContext};
use xrbridge_auth::{AuthorizationPolicy, PolicyIntent};
use xrbridge_events::{
    AnchorId, AnchorKind, AuthorizationTier, BridgeRequest, BridgeResponse, CameraState, CvFrame,
    DetectionImageDescriptor, FrameSnapshot, Transform, TransportSinkRef, WorldMappingStatus,
};
use xrbridge_images::{ActivateCompletion, CreateCompletion, DetectionImageWorkflow, ImageAction};
use xrbridge_worldmap::{WorldMapError, WorldMapRecord, WorldMapStore};

use crate::config::{RunOptions, SessionConfig, SessionState, WorldAlignment};
use crate::sensor::{SensorError, SensorEvent, SensorSession};
use crate::{BridgeError, Result};

/// Completion for a world-map retrieval request.
pub type WorldMapCompletion = Box<dyn FnOnce(Result<Vec<u8>>) + Send>;

/// Completion for a dispatched web request.
pub type ResponseCompletion = Box<dyn FnOnce(BridgeResponse) + Send>;

struct LifecycleState {
    session: SessionState,
    config: SessionConfig,
    camera: CameraState,
    world_mapping: WorldMappingStatus,
    /// Set by `requestCvFrame`, consumed by the next published frame.
    cv_frame_requested: bool,
    /// Downscale factor applied to outgoing camera frames.
    cv_scale_factor: f32,
    /// World-map retrieval buffered while the tier is undetermined.
    pending_world_map: Option<WorldMapCompletion>,
    backgrounded_at: Option<DateTime<Utc>>,
    remove_anchors_on_next_run: bool,
    heading_fallback_used: bool,
    interrupted: bool,
}

/// Orchestrates the sensor session, authorization policy, anchor registry,
/// detection-image workflow, and world-map store behind the web transport.
pub struct SessionBridge {
    sensor: Arc<dyn SensorSession>,
    sink: TransportSinkRef,
    maps: Arc<WorldMapStore>,
    policy: Mutex<AuthorizationPolicy>,
    registry: AnchorRegistry,
    images: DetectionImageWorkflow,
    state: Mutex<LifecycleState>,
    grace_window: Duration,
    events_tx: Sender<SensorEvent>,
    events_rx: Receiver<SensorEvent>,
}

impl SessionBridge {
    pub fn new(sensor: Arc<dyn SensorSession>, sink: TransportSinkRef, maps: WorldMapStore) -> Self {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        Self {
            sensor,
            sink,
            maps: Arc::new(maps),
            policy: Mutex::new(AuthorizationPolicy::new()),
            registry: AnchorRegistry::new(),
            images: DetectionImageWorkflow::new(),
            state: Mutex::new(LifecycleState {
                session: SessionState::Unknown,
                config: SessionConfig::default(),
                camera: CameraState::default(),
                world_mapping: WorldMappingStatus::NotAvailable,
                cv_frame_requested: false,
                cv_scale_factor: 1.0,
                pending_world_map: None,
                backgrounded_at: None,
                remove_anchors_on_next_run: false,
                heading_fallback_used: false,
                interrupted: false,
            }),
            grace_window: Duration::minutes(10),
            events_tx,
            events_rx,
        }
    }

    /// How long the app may stay backgrounded before anchors are considered
    /// stale on the next foreground.
    pub fn with_grace_window(mut self, window: Duration) -> Self {
        self.grace_window = window;
        self
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, LifecycleState> {
        self.state.lock().expect("lifecycle state mutex poisoned")
    }

    fn lock_policy(&self) -> std::sync::MutexGuard<'_, AuthorizationPolicy> {
        self.policy.lock().expect("authorization policy mutex poisoned")
    }

    // ---- authorization -------------------------------------------------

    pub fn authorization(&self) -> AuthorizationTier {
        self.lock_policy().tier()
    }

    /// Record the highest tier the user will grant this site.
    pub fn set_user_grant(&self, grant: AuthorizationTier) {
        self.lock_policy().set_user_grant(grant);
    }

    /// Mark one anchor as individually approved by the user.
    pub fn approve_anchor(&self, id: AnchorId) {
        self.lock_policy().approve_anchor(id);
    }

    /// Grant the page the requested tier, clamped to the user's grant.
    /// Returns the tier actually granted.
    pub fn request_session(&self, requested: AuthorizationTier) -> AuthorizationTier {
        let granted = self.lock_policy().max_tier_for(requested);
        self.set_authorization(granted);
        granted
    }

    /// Transition the disclosure tier and execute the resulting intents.
    pub fn set_authorization(&self, tier: AuthorizationTier) {
        let intents = self.lock_policy().set_tier(tier);
        for intent in intents {
            self.execute_intent(intent);
        }
    }

    fn execute_intent(&self, intent: PolicyIntent) {
        match intent {
            PolicyIntent::ResyncLiveAnchors | PolicyIntent::RegisterQualifyingAnchors => {
                self.resync_live_anchors();
            }
            PolicyIntent::ClearRegistry => self.registry.clear(),
            PolicyIntent::ReplayQueuedImageCreations => self.images.replay_queued_creations(),
            PolicyIntent::DenyQueuedImageCreations => self.images.deny_queued_creations(),
            PolicyIntent::ServicePendingWorldMap => {
                let pending = self.lock_state().pending_world_map.take();
                if let Some(completion) = pending {
                    self.service_world_map(completion);
                }
            }
            PolicyIntent::DenyPendingWorldMap => {
                let pending = self.lock_state().pending_world_map.take();
                if let Some(completion) = pending {
                    completion(Err(BridgeError::PermissionDenied));
                }
            }
        }
    }

    /// Register every live anchor that qualifies under the current tier, so
    /// nothing that existed before authorization is silently skipped.
    fn resync_live_anchors(&self) {
        let records = self.sensor.current_anchors();
        let ctx = self.ingest_context(&records);
        let policy = self.lock_policy().clone();
        let registered = self.registry.ingest_added(&records, &policy, ctx);
        if !registered.is_empty() {
            tracing::debug!(count = registered.len(), "resynced live anchors after tier change");
        }
    }

    fn ingest_context(&self, incoming: &[AnchorRecord]) -> IngestContext {
        let mut plane_ids: HashSet<AnchorId> = self
            .sensor
            .current_anchors()
            .iter()
            .filter(|r| r.kind() == AnchorKind::Plane)
            .map(|r| r.id)
            .collect();
        plane_ids.extend(
            incoming
                .iter()
                .filter(|r| r.kind() == AnchorKind::Plane)
                .map(|r| r.id),
        );
        IngestContext {
            face_tracking: self.lock_state().config.is_face_tracking(),
            live_plane_count: plane_ids.len(),
        }
    }

    // ---- detection images ----------------------------------------------

    pub fn create_detection_image(
        &self,
        descriptor: DetectionImageDescriptor,
        completion: CreateCompletion,
    ) {
        let tier = self.authorization();
        self.images.create(descriptor, tier, completion);
    }

    pub fn activate_detection_image(&self, name: &str, completion: ActivateCompletion) {
        let face_tracking = self.lock_state().config.is_face_tracking();
        if let Some(action) = self.images.activate(name, face_tracking, completion) {
            self.apply_image_action(action);
        }
    }

    pub fn deactivate_detection_image(&self, name: &str) -> Result<()> {
        let face_tracking = self.lock_state().config.is_face_tracking();
        let action = self.images.deactivate(name, face_tracking)?;
        self.apply_image_action(action);
        Ok(())
    }

    pub fn destroy_detection_image(&self, name: &str) -> Result<()> {
        self.images.destroy(name)?;
        Ok(())
    }

    fn apply_image_action(&self, action: ImageAction) {
        match action {
            ImageAction::UpdateDetectionSet => self.update_detection_set(),
            ImageAction::RemoveAnchor(id) => self.sensor.remove_anchor(id),
        }
    }

    /// Re-run the session configuration with the current detection set.
    fn update_detection_set(&self) {
        let config = {
            let mut state = self.lock_state();
            state.config.detection_images = self.images.detection_descriptors();
            if state.session != SessionState::Running {
                return;
            }
            state.config.clone()
        };
        if let Err(error) = self.sensor.run(&config, RunOptions::default()) {
            self.on_sensor_failure(error);
        }
    }

    // ---- world maps ------------------------------------------------------

    /// Retrieve (and persist) the current world map.
    ///
    /// At a world-sensing tier the request is serviced immediately. While
    /// the tier is undetermined it is buffered; the next tier transition
    /// services or denies it. At a restricted tier it is denied outright.
    pub fn get_world_map(&self, completion: WorldMapCompletion) {
        let tier = self.authorization();
        if tier.grants_world_sensing() {
            self.service_world_map(completion);
            return;
        }
        if tier == AuthorizationTier::NotDetermined {
            let rejected = {
                let mut state = self.lock_state();
                if state.pending_world_map.is_some() {
                    Some(completion)
                } else {
                    state.pending_world_map = Some(completion);
                    None
                }
            };
            if let Some(completion) = rejected {
                completion(Err(BridgeError::Conflict(
                    "a world map request is already pending".into(),
                )));
            }
            return;
        }
        completion(Err(BridgeError::PermissionDenied));
    }

    fn service_world_map(&self, completion: WorldMapCompletion) {
        let precheck = WorldMapStore::check_save_preconditions(
            self.sensor.tracking_state(),
            self.sensor.world_mapping_status(),
        );
        if let Err(error) = precheck {
            completion(Err(error.into()));
            return;
        }
        let maps = Arc::clone(&self.maps);
        self.sensor.acquire_world_map(Box::new(move |result| match result {
            Ok(blob) => {
                maps.persist(
                    blob.clone(),
                    Box::new(|outcome| {
                        if let Err(error) = outcome {
                            tracing::error!(%error, "world map persistence failed");
                        }
                    }),
                );
                completion(Ok(blob));
            }
            Err(error) => {
                maps.discard();
                completion(Err(WorldMapError::Acquisition(error.to_string()).into()));
            }
        }));
    }

    /// Load the persisted world map, read-only.
    pub fn load_world_map(&self) -> Result<WorldMapRecord> {
        Ok(self.maps.load()?)
    }

    /// Hand an inbound world map to the sensor as the relocalization target
    /// for an immediate re-run.
    pub fn set_world_map(&self, blob: Vec<u8>) -> Result<()> {
        if !self.authorization().grants_world_sensing() {
            return Err(BridgeError::PermissionDenied);
        }
        if blob.is_empty() {
            return Err(BridgeError::InvalidWorldMap);
        }
        self.lock_state().config.initial_world_map = Some(blob);
        self.run_sensor(RunOptions::reset())?;
        self.registry.clear();
        Ok(())
    }

    // ---- user anchors ----------------------------------------------------

    /// Create a user anchor at the given pose, remembering the external id
    /// the page supplied for it.
    pub fn add_anchor(&self, user_id: &str, transform: Transform) -> Result<AnchorId> {
        let id = self
            .sensor
            .add_anchor(transform)
            .map_err(|e| BridgeError::Hardware(e.to_string()))?;
        self.registry.set_user_id(id, user_id);
        Ok(id)
    }

    /// Request removal of anchors by the page-supplied external id or the
    /// raw anchor id. Unknown ids are skipped.
    pub fn remove_anchors(&self, ids: &[String]) {
        for requested in ids {
            if let Some(id) = self.registry.anchor_for_user_id(requested) {
                self.sensor.remove_anchor(id);
            } else if let Ok(uuid) = requested.parse::<uuid::Uuid>() {
                self.sensor.remove_anchor(AnchorId::from(uuid));
            } else {
                tracing::debug!(id = %requested, "remove requested for an unknown anchor");
            }
        }
    }

    // ---- computer vision ---------------------------------------------------

    /// Arm delivery of one downscaled camera frame with the next publish.
    pub fn request_cv_frame(&self) -> Result<()> {
        if self.authorization() != AuthorizationTier::VideoCameraAccess {
            return Err(BridgeError::PermissionDenied);
        }
        self.lock_state().cv_frame_requested = true;
        Ok(())
    }

    /// Cache the downscale factor applied to outgoing camera frames.
    pub fn set_cv_scale_factor(&self, factor: f32) {
        self.lock_state().cv_scale_factor = factor;
    }

    // ---- lifecycle -------------------------------------------------------

    pub fn session_state(&self) -> SessionState {
        self.lock_state().session
    }

    /// Last world-mapping status observed on a published frame.
    pub fn world_mapping_status(&self) -> WorldMappingStatus {
        self.lock_state().world_mapping
    }

    /// Whether the sensor reported an interruption that has not ended yet.
    pub fn is_interrupted(&self) -> bool {
        self.lock_state().interrupted
    }

    /// Start a fresh session: tracking is reset, existing anchors are
    /// removed, and the external-anchor-id mapping is cleared.
    pub fn start(&self, config: SessionConfig) -> Result<()> {
        {
            let mut state = self.lock_state();
            state.config = config;
            state.heading_fallback_used = false;
            state.remove_anchors_on_next_run = false;
        }
        self.run_sensor(RunOptions::reset())?;
        self.registry.clear();
        Ok(())
    }

    /// Re-run the current configuration without resetting, unless a prior
    /// stale-foreground marked anchors for removal, in which case this
    /// behaves like [`SessionBridge::start`].
    pub fn resume(&self) -> Result<()> {
        let remove = {
            let mut state = self.lock_state();
            std::mem::take(&mut state.remove_anchors_on_next_run)
        };
        if remove {
            tracing::debug!("stale anchors flagged, resuming with a full reset");
            self.run_sensor(RunOptions::reset())?;
            self.registry.clear();
            Ok(())
        } else {
            self.run_sensor(RunOptions::default())
        }
    }

    /// Pause the sensor and freeze disclosure. Registry state is preserved
    /// for a subsequent resume.
    pub fn pause(&self) {
        self.sensor.pause();
        self.lock_state().session = SessionState::Paused;
    }

    pub fn did_enter_background(&self) {
        self.pause();
        self.lock_state().backgrounded_at = Some(Utc::now());
    }

    /// Foreground policy: within the grace window, resume as-is. After it,
    /// resume from the persisted world map when one exists; otherwise flag
    /// existing anchors for removal on the run that follows.
    pub fn will_enter_foreground(&self) -> Result<()> {
        let backgrounded_at = self.lock_state().backgrounded_at.take();
        let within_grace = backgrounded_at
            .map(|at| Utc::now() - at <= self.grace_window)
            .unwrap_or(true);
        if within_grace {
            return self.resume();
        }
        match self.maps.load() {
            Ok(record) => {
                tracing::debug!("foregrounded after the grace window, relocalizing from the persisted map");
                self.lock_state().config.initial_world_map = Some(record.blob);
                self.run_sensor(RunOptions::reset_tracking_only())
            }
            Err(error) => {
                tracing::debug!(%error, "foregrounded after the grace window with no persisted map");
                self.lock_state().remove_anchors_on_next_run = true;
                self.resume()
            }
        }
    }

    fn run_sensor(&self, options: RunOptions) -> Result<()> {
        let config = self.lock_state().config.clone();
        match self.sensor.run(&config, options) {
            Ok(()) => {
                self.lock_state().session = SessionState::Running;
                Ok(())
            }
            Err(error) => self.try_heading_fallback(options, error),
        }
    }

    /// A sensor failure under gravity-and-heading alignment retries once
    /// with plain gravity; any further failure is fatal.
    fn try_heading_fallback(&self, options: RunOptions, error: SensorError) -> Result<()> {
        let retry_config = {
            let mut state = self.lock_state();
            if state.config.alignment == WorldAlignment::GravityAndHeading
                && !state.heading_fallback_used
            {
                state.heading_fallback_used = true;
                state.config.alignment = WorldAlignment::Gravity;
                Some(state.config.clone())
            } else {
                None
            }
        };
        match retry_config {
            Some(config) => {
                tracing::warn!(%error, "sensor rejected heading alignment, retrying with gravity");
                self.sensor
                    .run(&config, options)
                    .map_err(|e| BridgeError::Hardware(e.to_string()))?;
                self.lock_state().session = SessionState::Running;
                Ok(())
            }
            None => Err(BridgeError::Hardware(error.to_string())),
        }
    }

    fn on_sensor_failure(&self, error: SensorError) {
        tracing::error!(%error, "sensor session failed");
        if let Err(error) = self.try_heading_fallback(RunOptions::reset_tracking_only(), error) {
            tracing::error!(%error, "session halted, awaiting restart");
            self.lock_state().session = SessionState::Paused;
        }
    }

    // ---- sensor events -----------------------------------------------------

    /// Sender half for the sensor callback context.
    pub fn event_sender(&self) -> Sender<SensorEvent> {
        self.events_tx.clone()
    }

    /// Drain and handle every queued sensor event.
    pub fn pump_events(&self) {
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event);
        }
    }

    pub fn handle_event(&self, event: SensorEvent) {
        match event {
            SensorEvent::AnchorsAdded(records) => self.on_anchors_added(records),
            SensorEvent::AnchorsUpdated(records) => {
                let ctx = self.ingest_context(&records);
                self.registry.ingest_updated(&records, ctx);
            }
            SensorEvent::AnchorsRemoved(records) => self.on_anchors_removed(records),
            SensorEvent::FrameUpdated { camera, cv_frame } => self.publish_frame(camera, cv_frame),
            SensorEvent::TrackingChanged(tracking) => {
                tracing::debug!(?tracking, "tracking state changed");
                self.lock_state().camera.tracking = tracking;
            }
            SensorEvent::Interrupted => {
                tracing::warn!("sensor session interrupted");
                self.lock_state().interrupted = true;
            }
            SensorEvent::InterruptionEnded => {
                // Relocalization is always attempted.
                tracing::debug!("sensor interruption ended, relocalizing");
                self.lock_state().interrupted = false;
            }
            SensorEvent::Failed(error) => self.on_sensor_failure(error),
        }
    }

    fn on_anchors_added(&self, records: Vec<AnchorRecord>) {
        let ctx = self.ingest_context(&records);
        let policy = self.lock_policy().clone();
        let registered = self.registry.ingest_added(&records, &policy, ctx);
        for record in &records {
            if !registered.contains(&record.id) {
                continue;
            }
            if let Some(name) = record.image_name() {
                self.images.on_image_anchor_added(name, record.snapshot(None));
            }
        }
    }

    fn on_anchors_removed(&self, records: Vec<AnchorRecord>) {
        let ids: Vec<AnchorId> = records.iter().map(|r| r.id).collect();
        self.registry.ingest_removed(&ids);
        for record in &records {
            if let Some(name) = record.image_name() {
                if let Some(action) = self.images.on_image_anchor_removed(name) {
                    self.apply_image_action(action);
                }
            }
        }
    }

    // ---- frame publishing -----------------------------------------------------

    /// Build and publish the filtered per-frame snapshot. Publishing is
    /// suppressed while paused; diff buffers keep accumulating for the next
    /// resume.
    fn publish_frame(&self, camera: CameraState, cv_frame: Option<CvFrame>) {
        let mapping = self.sensor.world_mapping_status();
        let tier = self.authorization();
        let cv_frame = {
            let mut state = self.lock_state();
            if state.session != SessionState::Running {
                return;
            }
            state.camera = camera.clone();
            state.world_mapping = mapping;
            if tier == AuthorizationTier::VideoCameraAccess && state.cv_frame_requested {
                state.cv_frame_requested = false;
                cv_frame.map(|mut frame| {
                    frame.scale_factor = state.cv_scale_factor;
                    frame
                })
            } else {
                None
            }
        };
        if matches!(
            tier,
            AuthorizationTier::NotDetermined | AuthorizationTier::Denied
        ) {
            return;
        }
        let diff = self.registry.snapshot_diff();
        let snapshot = FrameSnapshot {
            objects: self.registry.objects(),
            added: diff.added,
            removed: diff.removed,
            camera: Some(camera),
            world_mapping_status: tier.grants_world_sensing().then_some(mapping),
            cv_frame,
        };
        self.sink.publish(snapshot);
    }

    // ---- request dispatch -----------------------------------------------------

    /// Map one inbound web request onto the corresponding bridge operation.
    /// Every request resolves `respond` exactly once.
    pub fn dispatch(&self, request: BridgeRequest, respond: ResponseCompletion) {
        match request {
            BridgeRequest::RequestSession { tier } => {
                let granted = self.request_session(tier);
                match serde_json::to_value(granted) {
                    Ok(value) => {
                        respond(BridgeResponse::with_payload(json!({ "authorization": value })))
                    }
                    Err(error) => respond(BridgeResponse::fail(error.to_string())),
                }
            }
            BridgeRequest::CreateDetectionImage { descriptor } => {
                self.create_detection_image(
                    descriptor,
                    Box::new(move |result| match result {
                        Ok(()) => respond(BridgeResponse::ok()),
                        Err(error) => respond(BridgeResponse::fail(error.to_string())),
                    }),
                );
            }
            BridgeRequest::ActivateDetectionImage { name } => {
                self.activate_detection_image(
                    &name,
                    Box::new(move |result| match result {
                        Ok(snapshot) => match serde_json::to_value(&snapshot) {
                            Ok(value) => {
                                respond(BridgeResponse::with_payload(json!({ "anchor": value })))
                            }
                            Err(error) => respond(BridgeResponse::fail(error.to_string())),
                        },
                        Err(error) => respond(BridgeResponse::fail(error.to_string())),
                    }),
                );
            }
            BridgeRequest::DeactivateDetectionImage { name } => {
                respond(result_response(self.deactivate_detection_image(&name)));
            }
            BridgeRequest::DestroyDetectionImage { name } => {
                respond(result_response(self.destroy_detection_image(&name)));
            }
            BridgeRequest::GetWorldMap => {
                self.get_world_map(Box::new(move |result| match result {
                    Ok(blob) => respond(BridgeResponse::with_payload(json!({ "worldMap": blob }))),
                    Err(error) => respond(BridgeResponse::fail(error.to_string())),
                }));
            }
            BridgeRequest::SetWorldMap { map } => {
                respond(result_response(self.set_world_map(map)));
            }
            BridgeRequest::AddAnchor { user_id, transform } => {
                match self.add_anchor(&user_id, transform) {
                    Ok(id) => respond(BridgeResponse::with_payload(json!({
                        "anchorId": id.to_string(),
                        "userAnchorId": user_id,
                    }))),
                    Err(error) => respond(BridgeResponse::fail(error.to_string())),
                }
            }
            BridgeRequest::RemoveAnchors { ids } => {
                self.remove_anchors(&ids);
                respond(BridgeResponse::ok());
            }
            BridgeRequest::RequestCvFrame => {
                respond(result_response(self.request_cv_frame()));
            }
        }
    }
}

fn result_response(result: Result<()>) -> BridgeResponse {
    match result {
        Ok(()) => BridgeResponse::ok(),
        Err(error) => BridgeResponse::fail(error.to_string()),
    }
}
