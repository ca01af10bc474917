//! Call manager for orchestrating call lifecycle.
//!
//! The manager owns the one call a client may have: its phase, its peer
//! session and everything the UI observes. It runs as a single task that
//! consumes UI commands, inbound signals, peer connection events and timers
//! from one `select!` loop, so state is only ever touched from one place.

use super::channel::{ChannelSink, SignalChannel, SignalSubscription};
use super::error::{CallError, SessionError, TransportError};
use super::media::{MediaDevices, MediaStream, MediaTrack};
use super::notify::{CallNotifier, NotificationSink};
use super::peer::{ConnectionState, PeerConnectionFactory, PeerEvent};
use super::recovery::RecoveryManager;
use super::session::PeerSession;
use super::state::{CallState, FailedCall, PendingCall};
use crate::config::CallConfig;
use crate::store::SignalStore;
use callcore::{
    CallErrorInfo, CallKey, CallPhase, CallSignal, CallTransition, CallType, EndReason,
    FailureCause, IceCandidateInit, InvalidTransition, SessionDescription, SignalPayload, classify,
    format_call_duration, is_offerer,
};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::{HashSet, VecDeque};
use std::future::pending;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;

const COMMAND_CAPACITY: usize = 32;
const ERROR_CAPACITY: usize = 16;
const HELD_CANDIDATE_LIMIT: usize = 64;

/// External collaborators a manager is built on.
pub struct CallBackends {
    pub store: Arc<dyn SignalStore>,
    pub peers: Arc<dyn PeerConnectionFactory>,
    pub devices: Arc<dyn MediaDevices>,
    pub notifications: Arc<dyn NotificationSink>,
}

struct ActiveCall {
    key: CallKey,
    call_type: CallType,
    /// Display name from `call-request`, incoming calls only.
    caller_name: Option<String>,
    connected_at: Option<DateTime<Utc>>,
    /// Whether the remote party has heard about this call.
    announced: bool,
}

/// Bounded window of recently delivered signal ids.
struct SeenSignals {
    order: VecDeque<String>,
    ids: HashSet<String>,
    capacity: usize,
}

impl SeenSignals {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            ids: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns `false` if the id was seen recently.
    fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.capacity == 0 {
            return true;
        }
        if self.order.len() == self.capacity
            && let Some(oldest) = self.order.pop_front()
        {
            self.ids.remove(&oldest);
        }
        self.order.push_back(id.to_string());
        self.ids.insert(id.to_string());
        true
    }
}

type Reply<T> = oneshot::Sender<Result<T, CallError>>;

enum Command {
    Initiate {
        remote_user: String,
        conversation_id: String,
        call_type: CallType,
        reply: Reply<()>,
    },
    Confirm {
        call_type: Option<CallType>,
        reply: Reply<()>,
    },
    Cancel {
        reply: Reply<()>,
    },
    Accept {
        reply: Reply<()>,
    },
    Reject {
        reply: Reply<()>,
    },
    End {
        reply: Reply<()>,
    },
    StartScreenShare {
        reply: Reply<MediaStream>,
    },
    StopScreenShare {
        reply: Reply<bool>,
    },
    ToggleMicrophone {
        reply: oneshot::Sender<bool>,
    },
    ToggleCamera {
        reply: oneshot::Sender<bool>,
    },
}

pub struct CallManager {
    local_user: String,
    config: CallConfig,
    channel: Arc<SignalChannel>,
    peers: Arc<dyn PeerConnectionFactory>,
    devices: Arc<dyn MediaDevices>,
    notifier: CallNotifier,
    recovery: Arc<RecoveryManager>,
    phase: CallPhase,
    call: Option<ActiveCall>,
    pending: Option<PendingCall>,
    failed_call: Option<FailedCall>,
    session: Option<PeerSession>,
    peer_events: Option<mpsc::Receiver<PeerEvent>>,
    /// Offer that arrived while still ringing, answered on accept.
    held_offer: Option<SessionDescription>,
    /// Candidates trickled while ringing, replayed into the session on accept.
    held_candidates: VecDeque<IceCandidateInit>,
    ring_deadline: Option<Instant>,
    seen: SeenSignals,
    state_tx: watch::Sender<CallState>,
    errors_tx: broadcast::Sender<CallErrorInfo>,
}

impl CallManager {
    pub fn new(local_user: impl Into<String>, config: CallConfig, backends: CallBackends) -> Self {
        let local_user = local_user.into();
        let channel = Arc::new(SignalChannel::new(
            local_user.clone(),
            backends.store,
            &config,
        ));
        let (state_tx, _) = watch::channel(CallState::default());
        let (errors_tx, _) = broadcast::channel(ERROR_CAPACITY);
        Self {
            channel,
            peers: backends.peers,
            devices: backends.devices,
            notifier: CallNotifier::new(backends.notifications),
            recovery: Arc::new(RecoveryManager::new(config.retry)),
            phase: CallPhase::Idle,
            call: None,
            pending: None,
            failed_call: None,
            session: None,
            peer_events: None,
            held_offer: None,
            held_candidates: VecDeque::new(),
            ring_deadline: None,
            seen: SeenSignals::new(config.dedup_capacity),
            state_tx,
            errors_tx,
            local_user,
            config,
        }
    }

    pub fn local_user(&self) -> &str {
        &self.local_user
    }

    pub fn phase(&self) -> CallPhase {
        self.phase
    }

    pub fn state(&self) -> CallState {
        self.state_tx.borrow().clone()
    }

    pub fn session(&self) -> Option<&PeerSession> {
        self.session.as_ref()
    }

    pub fn subscribe_errors(&self) -> broadcast::Receiver<CallErrorInfo> {
        self.errors_tx.subscribe()
    }

    fn transition(&mut self, transition: CallTransition) -> Result<CallPhase, InvalidTransition> {
        let next = self.phase.next(transition)?;
        if next != self.phase {
            debug!(target: "Call/Manager", "{} -> {next} ({transition:?})", self.phase);
        }
        self.phase = next;
        Ok(next)
    }

    fn publish(&self) {
        let call = self.call.as_ref();
        let session = self.session.as_ref();
        let state = CallState {
            phase: self.phase,
            is_in_call: matches!(
                self.phase,
                CallPhase::OutgoingRinging | CallPhase::Connecting | CallPhase::InCall
            ),
            is_incoming_call: self.phase == CallPhase::IncomingRinging,
            call_type: call.map(|c| c.call_type),
            remote_user_id: call.map(|c| c.key.remote_user.clone()),
            conversation_id: call.map(|c| c.key.conversation_id.clone()),
            caller_name: call.and_then(|c| c.caller_name.clone()),
            local_stream: session.and_then(|s| s.local_stream().cloned()),
            remote_stream: session.and_then(|s| s.remote_stream().cloned()),
            is_screen_sharing: session.is_some_and(|s| s.is_screen_sharing()),
            connected_at: call.and_then(|c| c.connected_at),
            pending_call: self.pending.clone(),
            failed_call: self.failed_call.clone(),
        };
        self.state_tx.send_replace(state);
    }

    fn is_current_remote(&self, user: &str) -> bool {
        self.call
            .as_ref()
            .is_some_and(|c| c.key.remote_user == user)
    }

    fn arm_ring_timer(&mut self) {
        self.ring_deadline = self.config.ring_timeout.map(|t| Instant::now() + t);
    }

    async fn send_to_remote(&self, payload: &SignalPayload) -> Result<(), TransportError> {
        let Some(call) = &self.call else {
            return Ok(());
        };
        self.channel
            .send(&call.key.remote_user, &call.key.conversation_id, payload)
            .await
            .map(|_| ())
    }

    /// Replaces any existing session with a fresh one for the current call.
    async fn open_session(&mut self, call_type: CallType) -> Result<(), SessionError> {
        if let Some(mut stale) = self.session.take() {
            warn!(target: "Call/Manager", "Closing stale peer session");
            stale.close().await;
        }
        let Some(call) = &self.call else {
            return Err(SessionError::Closed);
        };
        let (pc, events) = self
            .peers
            .create_peer_connection(&self.config.ice_servers)
            .map_err(|e| SessionError::negotiation("createPeerConnection", e))?;
        let sink = Arc::new(ChannelSink::new(
            self.channel.clone(),
            call.key.remote_user.clone(),
            call.key.conversation_id.clone(),
        ));
        self.session = Some(PeerSession::new(
            pc,
            self.devices.clone(),
            sink,
            call_type,
            self.config.media.clone(),
        ));
        self.peer_events = Some(events);
        Ok(())
    }

    // ---- UI actions ----

    /// Records the call the user wants to place, pending confirmation.
    pub fn initiate_call(
        &mut self,
        remote_user: impl Into<String>,
        conversation_id: impl Into<String>,
        call_type: CallType,
    ) -> Result<(), CallError> {
        if self.phase.is_active() {
            return Err(CallError::Busy(self.phase));
        }
        self.pending = Some(PendingCall {
            remote_user: remote_user.into(),
            conversation_id: conversation_id.into(),
            call_type,
        });
        self.publish();
        Ok(())
    }

    pub fn cancel_pending_call(&mut self) -> Result<(), CallError> {
        self.pending.take().ok_or(CallError::NoPendingCall)?;
        self.publish();
        Ok(())
    }

    /// Places the pending call, optionally switching its type.
    ///
    /// Local media is acquired before the remote party is rung, so a
    /// permission or device failure never reaches the other side.
    pub async fn confirm_call(&mut self, call_type: Option<CallType>) -> Result<(), CallError> {
        let pending = self.pending.take().ok_or(CallError::NoPendingCall)?;
        if self.phase.is_active() {
            self.publish();
            return Err(CallError::Busy(self.phase));
        }
        let call_type = call_type.unwrap_or(pending.call_type);
        self.transition(CallTransition::Confirmed)?;
        self.failed_call = None;
        self.held_offer = None;
        self.held_candidates.clear();
        self.call = Some(ActiveCall {
            key: CallKey::new(pending.remote_user, pending.conversation_id),
            call_type,
            caller_name: None,
            connected_at: None,
            announced: false,
        });
        self.publish();

        if let Err(e) = self.open_session(call_type).await {
            return Err(self.fail_with(e).await);
        }
        let acquired = match self.session.as_mut() {
            Some(session) => session
                .acquire_local_media(call_type.is_video(), true)
                .await
                .map(|_| ()),
            None => Err(SessionError::Closed),
        };
        if let Err(e) = acquired {
            return Err(self.fail_with(e).await);
        }
        self.publish();

        let request = SignalPayload::CallRequest {
            call_type,
            caller_name: self.config.caller_name.clone(),
        };
        if let Err(e) = self.send_to_remote(&request).await {
            return Err(self.fail_with(e.into()).await);
        }
        if let Some(call) = self.call.as_mut() {
            call.announced = true;
            info!(target: "Call/Manager", "Calling {} ({call_type})", call.key.remote_user);
        }
        self.arm_ring_timer();
        Ok(())
    }

    /// `initiate_call` and `confirm_call` in one step.
    pub async fn start_call(
        &mut self,
        remote_user: impl Into<String>,
        conversation_id: impl Into<String>,
        call_type: CallType,
    ) -> Result<(), CallError> {
        self.initiate_call(remote_user, conversation_id, call_type)?;
        self.confirm_call(None).await
    }

    pub async fn accept_call(&mut self) -> Result<(), CallError> {
        if !self.phase.can_accept() {
            return Err(CallError::NoIncomingCall);
        }
        let Some(call_type) = self.call.as_ref().map(|c| c.call_type) else {
            return Err(CallError::NoIncomingCall);
        };
        self.transition(CallTransition::LocalAccepted)?;
        self.ring_deadline = None;
        self.notifier.stop_incoming().await;
        self.publish();

        if let Err(e) = self.open_session(call_type).await {
            return Err(self.fail_with(e).await);
        }
        let accept = SignalPayload::CallAccept {
            call_type: Some(call_type),
        };
        if let Err(e) = self.send_to_remote(&accept).await {
            return Err(self.fail_with(e.into()).await);
        }
        info!(target: "Call/Manager", "Accepted {call_type} call, waiting for offer");
        self.publish();

        let held = std::mem::take(&mut self.held_candidates);
        if let Some(session) = self.session.as_mut() {
            for candidate in held {
                session.handle_ice_candidate(candidate).await;
            }
        }

        if let Some(offer) = self.held_offer.take() {
            self.answer_offer(offer).await?;
        }
        Ok(())
    }

    pub async fn reject_call(&mut self) -> Result<(), CallError> {
        if !self.phase.can_reject() {
            return Err(CallError::NoIncomingCall);
        }
        info!(target: "Call/Manager", "Rejecting incoming call");
        self.finish(EndReason::LocalRejected, Some(SignalPayload::CallReject))
            .await;
        Ok(())
    }

    /// Hangs up. Safe in any phase, including idle.
    pub async fn end_call(&mut self) -> Result<(), CallError> {
        self.pending = None;
        self.finish(EndReason::LocalEnded, Some(SignalPayload::EndCall))
            .await;
        self.publish();
        Ok(())
    }

    pub async fn start_screen_share(&mut self) -> Result<MediaStream, CallError> {
        if !matches!(self.phase, CallPhase::Connecting | CallPhase::InCall) {
            return Err(CallError::NotActive);
        }
        let session = self.session.as_mut().ok_or(CallError::NotActive)?;
        let stream = session.start_screen_share().await?;
        self.publish();
        Ok(stream)
    }

    pub async fn stop_screen_share(&mut self) -> Result<bool, CallError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(false);
        };
        let stopped = session.stop_screen_share().await?;
        self.publish();
        Ok(stopped)
    }

    pub fn toggle_microphone(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.toggle_microphone())
    }

    pub fn toggle_camera(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.toggle_camera())
    }

    // ---- teardown ----

    /// Returns to idle. Idempotent; `farewell` is only sent when the remote
    /// party knows about the call.
    async fn finish(&mut self, reason: EndReason, farewell: Option<SignalPayload>) {
        if !self.phase.is_active() && self.call.is_none() && self.session.is_none() {
            return;
        }
        self.ring_deadline = None;
        self.held_offer = None;
        self.held_candidates.clear();
        self.notifier.stop_incoming().await;

        let announced = self.call.as_ref().is_some_and(|c| c.announced);
        let farewell = farewell.filter(|_| announced);
        match (self.session.take(), farewell) {
            (Some(mut session), Some(SignalPayload::EndCall)) => {
                if let Err(e) = session.end_call().await {
                    warn!(target: "Call/Manager", "Failed to send end-call: {e}");
                }
            }
            (session, farewell) => {
                if let Some(mut session) = session {
                    session.close().await;
                }
                if let Some(payload) = farewell
                    && let Err(e) = self.send_to_remote(&payload).await
                {
                    warn!(target: "Call/Manager", "Failed to send {}: {e}", payload.signal_type());
                }
            }
        }
        self.peer_events = None;

        // Terminated is valid from every phase.
        self.phase = self
            .phase
            .next(CallTransition::Terminated(reason))
            .unwrap_or_default();
        if let Some(call) = self.call.take() {
            info!(target: "Call/Manager", "Call with {} ended ({reason:?})", call.key.remote_user);
            if let Some(at) = call.connected_at {
                let duration = format_call_duration((Utc::now() - at).num_seconds());
                self.notifier.call_ended(&duration).await;
            }
        }
        self.publish();
    }

    /// Classifies the failure, surfaces it and ends the call.
    async fn fail_call(&mut self, cause: FailureCause, reason: EndReason) -> CallErrorInfo {
        let mut info = classify(&cause);
        if let Some(call) = &self.call {
            info = info.with_retry_count(self.recovery.retry_count(&call.key.to_string()));
            if info.recoverable {
                self.failed_call = Some(FailedCall {
                    key: call.key.clone(),
                    call_type: call.call_type,
                    error: info.clone(),
                });
            }
        }
        warn!(target: "Call/Manager", "Call failed: {info}");
        // Nobody listening is fine.
        let _ = self.errors_tx.send(info.clone());
        self.finish(reason, Some(SignalPayload::EndCall)).await;
        info
    }

    async fn fail_with(&mut self, err: SessionError) -> CallError {
        CallError::Failed(self.fail_call(err.failure_cause(), EndReason::Failed).await)
    }

    async fn mark_connected(&mut self) {
        if self.phase != CallPhase::InCall {
            return;
        }
        let Some(call) = self.call.as_mut() else {
            return;
        };
        if call.connected_at.is_some() {
            return;
        }
        call.connected_at = Some(Utc::now());
        let peer = call
            .caller_name
            .clone()
            .unwrap_or_else(|| call.key.remote_user.clone());
        let call_type = call.call_type;
        info!(target: "Call/Manager", "In call with {peer}");
        self.notifier.call_started(&peer, call_type).await;
    }

    // ---- inbound signals ----

    pub async fn handle_signal(&mut self, signal: CallSignal) {
        if signal.to_user != self.local_user {
            debug!(target: "Call/Manager", "Ignoring signal for {}", signal.to_user);
            return;
        }
        if !self.seen.insert(&signal.id) {
            debug!(target: "Call/Manager", "Dropping duplicate signal {}", signal.id);
            return;
        }
        debug!(
            target: "Call/Manager",
            "Received {} from {} in {}",
            signal.signal_type(),
            signal.from_user,
            self.phase
        );

        let CallSignal {
            from_user,
            conversation_id,
            payload,
            ..
        } = signal;
        match payload {
            SignalPayload::CallRequest {
                call_type,
                caller_name,
            } => {
                self.on_call_request(from_user, conversation_id, call_type, caller_name)
                    .await
            }
            SignalPayload::CallAccept { .. } => self.on_call_accept(&from_user).await,
            SignalPayload::CallReject => {
                self.on_remote_end(&from_user, EndReason::RemoteRejected)
                    .await
            }
            SignalPayload::EndCall => self.on_remote_end(&from_user, EndReason::RemoteEnded).await,
            SignalPayload::Offer(offer) => self.on_offer(&from_user, offer).await,
            SignalPayload::Answer(answer) => self.on_answer(&from_user, answer).await,
            SignalPayload::IceCandidate(candidate) => {
                self.on_remote_candidate(&from_user, candidate).await
            }
        }
    }

    async fn on_call_request(
        &mut self,
        from: String,
        conversation_id: String,
        call_type: CallType,
        caller_name: String,
    ) {
        if self.phase == CallPhase::OutgoingRinging && self.is_current_remote(&from) {
            if is_offerer(&self.local_user, &from) {
                info!(target: "Call/Manager", "{from} called us too; keeping our call");
                return;
            }
            info!(target: "Call/Manager", "{from} called us too; taking their call");
            self.finish(EndReason::Superseded, None).await;
            self.ring_incoming(from, conversation_id, call_type, caller_name, false)
                .await;
            if let Err(e) = self.accept_call().await {
                warn!(target: "Call/Manager", "Failed to take over call: {e}");
            }
            return;
        }
        if self.phase.is_active() {
            debug!(target: "Call/Manager", "Busy, ignoring call-request from {from}");
            return;
        }
        self.ring_incoming(from, conversation_id, call_type, caller_name, true)
            .await;
    }

    async fn ring_incoming(
        &mut self,
        from: String,
        conversation_id: String,
        call_type: CallType,
        caller_name: String,
        ring: bool,
    ) {
        if let Err(e) = self.transition(CallTransition::RequestReceived) {
            debug!(target: "Call/Manager", "Ignoring call-request: {e}");
            return;
        }
        info!(target: "Call/Manager", "Incoming {call_type} call from {caller_name}");
        self.call = Some(ActiveCall {
            key: CallKey::new(from, conversation_id),
            call_type,
            caller_name: Some(caller_name.clone()),
            connected_at: None,
            announced: true,
        });
        if ring {
            self.notifier.incoming_call(&caller_name, call_type).await;
            self.arm_ring_timer();
        }
        self.publish();
    }

    async fn on_call_accept(&mut self, from: &str) {
        if self.phase != CallPhase::OutgoingRinging || !self.is_current_remote(from) {
            debug!(target: "Call/Manager", "Ignoring call-accept from {from}");
            return;
        }
        if let Err(e) = self.transition(CallTransition::RemoteAccepted) {
            debug!(target: "Call/Manager", "Ignoring call-accept: {e}");
            return;
        }
        self.ring_deadline = None;
        self.publish();

        let want_video = self.call.as_ref().is_some_and(|c| c.call_type.is_video());
        let started = match self.session.as_mut() {
            Some(session) => session.start_call(want_video, true).await.map(|_| ()),
            None => Err(SessionError::Closed),
        };
        match started {
            Ok(()) => {
                info!(target: "Call/Manager", "{from} accepted, offer sent");
                self.publish();
            }
            Err(e) => {
                self.fail_with(e).await;
            }
        }
    }

    async fn on_remote_end(&mut self, from: &str, reason: EndReason) {
        if !self.phase.is_active() || !self.is_current_remote(from) {
            debug!(target: "Call/Manager", "Ignoring {reason:?} from {from}");
            return;
        }
        if reason == EndReason::RemoteRejected && self.phase == CallPhase::OutgoingRinging {
            let _ = self.errors_tx.send(classify(&FailureCause::Rejected));
        }
        self.finish(reason, None).await;
    }

    async fn on_offer(&mut self, from: &str, offer: SessionDescription) {
        if !self.is_current_remote(from) {
            debug!(target: "Call/Manager", "Dropping offer from {from}, no call with them");
            return;
        }
        if let Err(e) = self.transition(CallTransition::OfferReceived) {
            debug!(target: "Call/Manager", "Ignoring offer: {e}");
            return;
        }
        if self.phase == CallPhase::IncomingRinging {
            debug!(target: "Call/Manager", "Holding offer until the call is accepted");
            self.held_offer = Some(offer);
            return;
        }
        self.ring_deadline = None;
        if let Err(e) = self.answer_offer(offer).await {
            debug!(target: "Call/Manager", "Offer not answered: {e}");
        }
    }

    async fn answer_offer(&mut self, offer: SessionDescription) -> Result<(), CallError> {
        let Some(call_type) = self.call.as_ref().map(|c| c.call_type) else {
            return Ok(());
        };
        let want_video = offer.call_type.unwrap_or(call_type).is_video();
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        if session.answer_sent() {
            debug!(target: "Call/Manager", "Offer already answered");
            return Ok(());
        }
        if session.offer_sent() {
            warn!(target: "Call/Manager", "Ignoring remote offer, ours is already out");
            return Ok(());
        }

        match session.answer_call(&offer, want_video, true).await {
            Ok(_) => {
                if self.phase == CallPhase::Connecting {
                    self.transition(CallTransition::AnswerSent)?;
                }
                self.mark_connected().await;
                self.publish();
                Ok(())
            }
            Err(e) => Err(self.fail_with(e).await),
        }
    }

    async fn on_answer(&mut self, from: &str, answer: SessionDescription) {
        if self.phase != CallPhase::Connecting || !self.is_current_remote(from) {
            debug!(target: "Call/Manager", "Ignoring answer in {}", self.phase);
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match session.handle_answer(&answer).await {
            Ok(true) => {
                if self.transition(CallTransition::AnswerReceived).is_ok() {
                    self.mark_connected().await;
                }
                self.publish();
            }
            Ok(false) => {}
            Err(e) => {
                self.fail_with(e).await;
            }
        }
    }

    async fn on_remote_candidate(&mut self, from: &str, candidate: IceCandidateInit) {
        if !self.is_current_remote(from) {
            debug!(target: "Call/Manager", "Dropping ICE candidate from {from}");
            return;
        }
        if self.phase == CallPhase::IncomingRinging {
            if self.held_candidates.len() >= HELD_CANDIDATE_LIMIT {
                warn!(target: "Call/Manager", "Too many candidates while ringing, dropping one");
                return;
            }
            self.held_candidates.push_back(candidate);
            return;
        }
        if self.phase.next(CallTransition::IceCandidate).is_err() {
            debug!(target: "Call/Manager", "Dropping ICE candidate in {}", self.phase);
            return;
        }
        if let Some(session) = self.session.as_mut() {
            session.handle_ice_candidate(candidate).await;
        }
    }

    // ---- peer connection events and timers ----

    pub async fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::IceCandidate(candidate) => {
                if let Some(session) = &self.session {
                    session.emit_local_candidate(candidate).await;
                }
            }
            PeerEvent::Track(track) => {
                if let Some(session) = self.session.as_mut() {
                    let (stream, added) = session.handle_remote_track(track);
                    if added {
                        debug!(
                            target: "Call/Manager",
                            "Remote stream now has {} tracks",
                            stream.tracks().len()
                        );
                    }
                    self.publish();
                }
            }
            PeerEvent::ConnectionState(state) => self.on_connection_state(state).await,
        }
    }

    async fn on_connection_state(&mut self, state: ConnectionState) {
        debug!(target: "Call/Manager", "Peer connection {state}");
        if state == ConnectionState::Connected {
            if self.phase == CallPhase::Connecting
                && self.transition(CallTransition::MediaConnected).is_ok()
            {
                self.mark_connected().await;
                self.publish();
            }
            return;
        }
        if !state.is_terminal() || !self.phase.is_active() {
            return;
        }
        if self.phase == CallPhase::InCall {
            warn!(target: "Call/Manager", "Peer connection {state}, ending call");
            self.finish(EndReason::ConnectionLost, Some(SignalPayload::EndCall))
                .await;
        } else {
            let detail = format!("peer connection {state}");
            self.fail_call(FailureCause::Connection { detail }, EndReason::ConnectionLost)
                .await;
        }
    }

    /// Incoming calls are auto-rejected; outgoing calls give up and report
    /// the peer as unavailable.
    pub async fn handle_ring_timeout(&mut self) {
        self.ring_deadline = None;
        match self.phase {
            CallPhase::IncomingRinging => {
                info!(target: "Call/Manager", "Missed call, rejecting");
                self.finish(EndReason::RingTimeout, Some(SignalPayload::CallReject))
                    .await;
            }
            CallPhase::OutgoingRinging => {
                info!(target: "Call/Manager", "No answer, giving up");
                self.fail_call(FailureCause::PeerUnavailable, EndReason::RingTimeout)
                    .await;
            }
            _ => {}
        }
    }

    #[cfg(test)]
    async fn drain_peer_events(&mut self) {
        loop {
            let event = match self.peer_events.as_mut().map(|rx| rx.try_recv()) {
                Some(Ok(event)) => event,
                _ => return,
            };
            self.handle_peer_event(event).await;
        }
    }

    // ---- event loop ----

    async fn handle_command(&mut self, command: Command) {
        // A dropped reply receiver just means the caller stopped waiting.
        match command {
            Command::Initiate {
                remote_user,
                conversation_id,
                call_type,
                reply,
            } => {
                let _ = reply.send(self.initiate_call(remote_user, conversation_id, call_type));
            }
            Command::Confirm { call_type, reply } => {
                let _ = reply.send(self.confirm_call(call_type).await);
            }
            Command::Cancel { reply } => {
                let _ = reply.send(self.cancel_pending_call());
            }
            Command::Accept { reply } => {
                let _ = reply.send(self.accept_call().await);
            }
            Command::Reject { reply } => {
                let _ = reply.send(self.reject_call().await);
            }
            Command::End { reply } => {
                let _ = reply.send(self.end_call().await);
            }
            Command::StartScreenShare { reply } => {
                let _ = reply.send(self.start_screen_share().await);
            }
            Command::StopScreenShare { reply } => {
                let _ = reply.send(self.stop_screen_share().await);
            }
            Command::ToggleMicrophone { reply } => {
                let _ = reply.send(self.toggle_microphone());
            }
            Command::ToggleCamera { reply } => {
                let _ = reply.send(self.toggle_camera());
            }
        }
    }

    /// Subscribes to signals and runs the manager on its own task.
    pub fn spawn(self) -> CallHandle {
        let (commands, rx) = mpsc::channel(COMMAND_CAPACITY);
        let subscription = self.channel.subscribe();
        let handle = CallHandle {
            local_user: self.local_user.clone(),
            commands,
            state: self.state_tx.subscribe(),
            errors: self.errors_tx.clone(),
            recovery: self.recovery.clone(),
        };
        tokio::spawn(self.run(rx, subscription));
        handle
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>, mut signals: SignalSubscription) {
        info!(target: "Call/Manager", "Call manager for {} started", self.local_user);
        loop {
            let ring_deadline = self.ring_deadline;
            let screen_track = self.session.as_ref().and_then(|s| s.screen_track());

            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                signal = signals.recv() => match signal {
                    Some(signal) => self.handle_signal(signal).await,
                    None => {
                        warn!(target: "Call/Manager", "Signal subscription ended");
                        break;
                    }
                },
                event = next_peer_event(&mut self.peer_events) => match event {
                    Some(event) => self.handle_peer_event(event).await,
                    None => self.peer_events = None,
                },
                _ = sleep_until(ring_deadline) => self.handle_ring_timeout().await,
                _ = track_ended(screen_track) => {
                    info!(target: "Call/Manager", "Screen capture ended, back to camera");
                    if let Err(e) = self.stop_screen_share().await {
                        warn!(target: "Call/Manager", "Failed to restore camera: {e}");
                    }
                }
            }
        }

        self.finish(EndReason::LocalEnded, Some(SignalPayload::EndCall))
            .await;
        info!(target: "Call/Manager", "Call manager for {} stopped", self.local_user);
    }
}

async fn next_peer_event(events: &mut Option<mpsc::Receiver<PeerEvent>>) -> Option<PeerEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => pending().await,
    }
}

async fn track_ended(track: Option<MediaTrack>) {
    match track {
        Some(track) => track.ended().await,
        None => pending().await,
    }
}

/// Cloneable front end for a spawned [`CallManager`].
#[derive(Clone)]
pub struct CallHandle {
    local_user: String,
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<CallState>,
    errors: broadcast::Sender<CallErrorInfo>,
    recovery: Arc<RecoveryManager>,
}

impl CallHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, CallError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| CallError::Stopped)?;
        rx.await.map_err(|_| CallError::Stopped)
    }

    pub fn local_user(&self) -> &str {
        &self.local_user
    }

    pub async fn initiate_call(
        &self,
        remote_user: &str,
        conversation_id: &str,
        call_type: CallType,
    ) -> Result<(), CallError> {
        self.request(|reply| Command::Initiate {
            remote_user: remote_user.to_string(),
            conversation_id: conversation_id.to_string(),
            call_type,
            reply,
        })
        .await?
    }

    pub async fn confirm_call(&self, call_type: Option<CallType>) -> Result<(), CallError> {
        self.request(|reply| Command::Confirm { call_type, reply })
            .await?
    }

    pub async fn cancel_pending_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Cancel { reply }).await?
    }

    pub async fn start_call(
        &self,
        remote_user: &str,
        conversation_id: &str,
        call_type: CallType,
    ) -> Result<(), CallError> {
        self.initiate_call(remote_user, conversation_id, call_type)
            .await?;
        self.confirm_call(None).await
    }

    pub async fn accept_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Accept { reply }).await?
    }

    pub async fn reject_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Reject { reply }).await?
    }

    pub async fn end_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::End { reply }).await?
    }

    pub async fn start_screen_share(&self) -> Result<MediaStream, CallError> {
        self.request(|reply| Command::StartScreenShare { reply })
            .await?
    }

    pub async fn stop_screen_share(&self) -> Result<bool, CallError> {
        self.request(|reply| Command::StopScreenShare { reply })
            .await?
    }

    pub async fn toggle_microphone(&self) -> Result<bool, CallError> {
        self.request(|reply| Command::ToggleMicrophone { reply })
            .await
    }

    pub async fn toggle_camera(&self) -> Result<bool, CallError> {
        self.request(|reply| Command::ToggleCamera { reply }).await
    }

    pub fn state(&self) -> CallState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<CallState> {
        self.state.clone()
    }

    /// Waits until the published state satisfies `predicate`.
    pub async fn wait_for(
        &self,
        mut predicate: impl FnMut(&CallState) -> bool,
    ) -> Result<CallState, CallError> {
        let mut rx = self.state.clone();
        let state = rx
            .wait_for(|state| predicate(state))
            .await
            .map_err(|_| CallError::Stopped)?;
        Ok((*state).clone())
    }

    pub fn errors(&self) -> broadcast::Receiver<CallErrorInfo> {
        self.errors.subscribe()
    }

    pub fn retry_count(&self, key: &CallKey) -> u32 {
        self.recovery.retry_count(&key.to_string())
    }

    /// Places the last failed call again under the retry budget. Returns
    /// whether the call went out.
    pub async fn retry_failed_call(&self) -> Result<bool, CallError> {
        let FailedCall {
            key,
            call_type,
            error,
        } = self.state().failed_call.ok_or(CallError::NoPendingCall)?;
        let call_id = key.to_string();
        let handle = self.clone();
        Ok(self
            .recovery
            .attempt_recovery(&error, &call_id, move || async move {
                handle
                    .start_call(&key.remote_user, &key.conversation_id, call_type)
                    .await
            })
            .await)
    }
}
