//! Client-side subscription proxy
//!
//! Sensor hardware is started with three calls (subscribe, configure,
//! activate) and stopped with two (deactivate, unsubscribe). The proxy keeps
//! one membership record per (sensor, user) so that any number of callbacks
//! in this process share one broker subscription per sensor and one data
//! channel overall.
//!
//! ```text
//!            subscribe           configure + activate
//! (absent) ────────────> Subscribed ──────────────────> Active
//!     ^                      │                            │
//!     │ unsubscribe          └────────> Deactivating <────┘
//!     └──────────────────────────────────────┘   deactivate
//! ```
//!
//! The data channel is created by the first subscribe and destroyed when the
//! last live membership goes away. Both happen under the state lock, so a
//! concurrent subscribe never observes a channel that is being torn down.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use sensor_channel::{CloseCallback, CloseReason, EventFrame, FrameCallback, ReadinessLoop, Transport};
use sensor_hal::{SensorDescriptor, SensorIdentity};
use sensor_service::{BrokerError, ServiceClient};

use crate::error::{AgentError, Result};
use crate::user::{SensorCallback, SensorUser, UserId};

/// Sampling period and report delay asked for by one user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rate {
    pub sampling_ns: i64,
    pub report_ns: i64,
}

impl Rate {
    pub fn new(sampling_ns: i64, report_ns: i64) -> Self {
        Self { sampling_ns, report_ns }
    }

    fn fastest(self, other: Rate) -> Rate {
        Rate {
            sampling_ns: self.sampling_ns.min(other.sampling_ns),
            report_ns: self.report_ns.min(other.report_ns),
        }
    }
}

/// Where one user stands with one sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribed,
    Active(Rate),
    Deactivating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Subscribed,
    Active(Rate),
    Deactivating,
}

struct Member {
    phase: Phase,
    pending: Option<Rate>,
    callback: SensorCallback,
}

impl Member {
    fn is_live(&self) -> bool {
        self.phase != Phase::Deactivating
    }
}

#[derive(Default)]
struct SensorEntry {
    members: HashMap<UserId, Member>,
    enabled: bool,
}

impl SensorEntry {
    fn has_live_members(&self) -> bool {
        self.members.values().any(Member::is_live)
    }

    fn live_member(&mut self, sensor: SensorIdentity, user: UserId) -> Result<&mut Member> {
        self.members
            .get_mut(&user)
            .filter(|m| m.is_live())
            .ok_or(AgentError::NotSubscribed { sensor, user })
    }
}

#[derive(Default)]
struct ProxyState {
    sensors: HashMap<SensorIdentity, SensorEntry>,
    channel: Option<(u64, Transport)>,
    next_channel: u64,
}

impl ProxyState {
    fn has_live_members(&self) -> bool {
        self.sensors.values().any(SensorEntry::has_live_members)
    }

    fn live_member(&mut self, sensor: SensorIdentity, user: UserId) -> Result<&mut Member> {
        self.sensors
            .get_mut(&sensor)
            .ok_or(AgentError::NotSubscribed { sensor, user })?
            .live_member(sensor, user)
    }
}

/// Reference-counted subscriptions on top of a broker session
pub struct SubscriptionProxy {
    service: Arc<dyn ServiceClient>,
    readiness: ReadinessLoop,
    state: Arc<Mutex<ProxyState>>,
    sensors: RwLock<Vec<SensorDescriptor>>,
}

impl SubscriptionProxy {
    /// Create a proxy with its own readiness loop
    pub fn new(service: Arc<dyn ServiceClient>) -> Result<Self> {
        let readiness = ReadinessLoop::start("sensor-agent")?;
        Ok(Self::with_readiness(service, readiness))
    }

    /// Create a proxy whose data channel is driven by `readiness`
    pub fn with_readiness(service: Arc<dyn ServiceClient>, readiness: ReadinessLoop) -> Self {
        Self {
            service,
            readiness,
            state: Arc::new(Mutex::new(ProxyState::default())),
            sensors: RwLock::new(Vec::new()),
        }
    }

    /// Sensors the broker enumerates, fetched on first use
    pub fn sensor_list(&self) -> Result<Vec<SensorDescriptor>> {
        {
            let cached = self.sensors.read();
            if !cached.is_empty() {
                return Ok(cached.clone());
            }
        }
        self.refresh_sensor_list()
    }

    fn refresh_sensor_list(&self) -> Result<Vec<SensorDescriptor>> {
        let fresh = self.service.sensor_list()?;
        *self.sensors.write() = fresh.clone();
        Ok(fresh)
    }

    fn is_known(&self, sensor: SensorIdentity) -> bool {
        self.sensors.read().iter().any(|d| d.identity == sensor)
    }

    fn ensure_known(&self, sensor: SensorIdentity) -> Result<()> {
        if self.is_known(sensor) {
            return Ok(());
        }
        let fresh = self.refresh_sensor_list()?;
        if fresh.iter().any(|d| d.identity == sensor) {
            return Ok(());
        }
        Err(AgentError::UnknownSensor(sensor))
    }

    // ========================================================================
    // Subscription lifecycle
    // ========================================================================

    /// Add `user` to `sensor`'s subscribers, opening the data channel if needed
    ///
    /// Subscribing twice is a no-op.
    pub fn subscribe(&self, sensor: SensorIdentity, user: &SensorUser) -> Result<()> {
        self.ensure_known(sensor)?;
        let mut state = self.state.lock();
        if state.channel.is_none() {
            let generation = state.next_channel;
            state.next_channel += 1;
            let transport = self.open_channel(generation)?;
            state.channel = Some((generation, transport));
        }

        let entry = state.sensors.entry(sensor).or_default();
        match entry.members.get_mut(&user.id()) {
            Some(member) if member.is_live() => {
                tracing::debug!(%sensor, user = %user.id(), "Already subscribed");
            }
            Some(member) => {
                member.phase = Phase::Subscribed;
                member.pending = None;
            }
            None => {
                entry.members.insert(
                    user.id(),
                    Member {
                        phase: Phase::Subscribed,
                        pending: None,
                        callback: user.callback(),
                    },
                );
            }
        }
        tracing::debug!(%sensor, user = %user.id(), "Subscribed");
        Ok(())
    }

    /// Remember the rate `user` wants applied on its next [`activate`](Self::activate)
    pub fn configure(&self, sensor: SensorIdentity, user: UserId, sampling_ns: i64, report_ns: i64) -> Result<()> {
        if sampling_ns < 0 || report_ns < 0 {
            return Err(AgentError::InvalidArgument(format!(
                "negative rate {sampling_ns}/{report_ns} for {sensor}"
            )));
        }
        self.ensure_known(sensor)?;
        let mut state = self.state.lock();
        state.live_member(sensor, user)?.pending = Some(Rate::new(sampling_ns, report_ns));
        Ok(())
    }

    /// Ask the broker to start `sensor` at the fastest rate any active user wants
    ///
    /// On failure `user` is dropped from the sensor's subscribers.
    pub fn activate(&self, sensor: SensorIdentity, user: UserId) -> Result<()> {
        self.ensure_known(sensor)?;
        let mut state = self.state.lock();
        let Some(pending) = state.live_member(sensor, user)?.pending else {
            return Err(AgentError::InvalidArgument(format!(
                "{user} must configure {sensor} before activating"
            )));
        };
        let rate = state.sensors[&sensor]
            .members
            .iter()
            .filter(|(id, _)| **id != user)
            .filter_map(|(_, m)| match m.phase {
                Phase::Active(rate) => Some(rate),
                _ => None,
            })
            .fold(pending, Rate::fastest);

        if let Err(e) = self.service.enable_sensor(sensor, rate.sampling_ns, rate.report_ns) {
            tracing::error!(%sensor, %user, "Activation failed: {}", e);
            self.evict(&mut state, sensor, user);
            return Err(e.into());
        }

        if let Some(entry) = state.sensors.get_mut(&sensor) {
            entry.enabled = true;
            if let Some(member) = entry.members.get_mut(&user) {
                member.phase = Phase::Active(pending);
            }
        }
        tracing::info!(%sensor, %user, sampling_ns = rate.sampling_ns, report_ns = rate.report_ns, "Sensor activated");
        Ok(())
    }

    fn evict(&self, state: &mut ProxyState, sensor: SensorIdentity, user: UserId) {
        if let Some(entry) = state.sensors.get_mut(&sensor) {
            entry.members.remove(&user);
            if entry.members.is_empty() {
                state.sensors.remove(&sensor);
            }
        }
        if !state.has_live_members() {
            if let Err(e) = self.close_channel(state) {
                tracing::warn!("Closing data channel after failed activation: {}", e);
            }
        }
    }

    /// Stop delivering to `user`; the last live user stops the sensor
    pub fn deactivate(&self, sensor: SensorIdentity, user: UserId) -> Result<()> {
        let known = self.ensure_known(sensor).is_ok();
        let mut state = self.state.lock();
        if !known && !state.sensors.contains_key(&sensor) {
            return Err(AgentError::UnknownSensor(sensor));
        }
        state.live_member(sensor, user)?.phase = Phase::Deactivating;

        let Some(entry) = state.sensors.get_mut(&sensor) else {
            return Ok(());
        };
        if entry.has_live_members() || !entry.enabled {
            return Ok(());
        }
        entry.enabled = false;
        if !known {
            tracing::warn!(%sensor, "Sensor is gone, skipping disable");
            return Ok(());
        }
        self.service.disable_sensor(sensor)?;
        tracing::info!(%sensor, %user, "Sensor deactivated");
        Ok(())
    }

    /// Forget `user`; the data channel closes with the last live user
    pub fn unsubscribe(&self, sensor: SensorIdentity, user: UserId) -> Result<()> {
        let known = self.is_known(sensor);
        let mut state = self.state.lock();
        let Some(entry) = state.sensors.get_mut(&sensor) else {
            if known {
                return Err(AgentError::NotDeactivated { sensor, user });
            }
            return Err(AgentError::UnknownSensor(sensor));
        };
        match entry.members.get(&user) {
            Some(member) if member.phase == Phase::Deactivating => {}
            _ => return Err(AgentError::NotDeactivated { sensor, user }),
        }
        entry.members.remove(&user);
        if entry.members.is_empty() {
            state.sensors.remove(&sensor);
        }
        tracing::debug!(%sensor, %user, "Unsubscribed");

        if !state.has_live_members() {
            self.close_channel(&mut state)?;
        }
        Ok(())
    }

    pub fn set_mode(&self, sensor: SensorIdentity, user: UserId, mode: i32) -> Result<()> {
        self.ensure_known(sensor)?;
        let mut state = self.state.lock();
        state.live_member(sensor, user)?;
        self.service.set_mode(sensor, mode)?;
        Ok(())
    }

    pub fn set_option(&self, sensor: SensorIdentity, user: UserId, option: i32) -> Result<()> {
        self.ensure_known(sensor)?;
        let mut state = self.state.lock();
        state.live_member(sensor, user)?;
        self.service.set_option(sensor, option)?;
        Ok(())
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    /// Sensors with at least one live subscriber
    pub fn subscribed_sensors(&self) -> HashSet<SensorIdentity> {
        self.state
            .lock()
            .sensors
            .iter()
            .filter(|(_, entry)| entry.has_live_members())
            .map(|(sensor, _)| *sensor)
            .collect()
    }

    pub fn state_of(&self, sensor: SensorIdentity, user: UserId) -> SubscriptionState {
        let state = self.state.lock();
        match state.sensors.get(&sensor).and_then(|e| e.members.get(&user)) {
            None => SubscriptionState::Unsubscribed,
            Some(member) => match member.phase {
                Phase::Subscribed => SubscriptionState::Subscribed,
                Phase::Active(rate) => SubscriptionState::Active(rate),
                Phase::Deactivating => SubscriptionState::Deactivating,
            },
        }
    }

    pub fn has_channel(&self) -> bool {
        self.state.lock().channel.is_some()
    }

    // ========================================================================
    // Data channel
    // ========================================================================

    fn open_channel(&self, generation: u64) -> Result<Transport> {
        let weak = Arc::downgrade(&self.state);
        let on_frame: FrameCallback = Arc::new(move |frame: EventFrame| fan_out(&weak, &frame));

        let weak = Arc::downgrade(&self.state);
        let on_close: CloseCallback = Arc::new(move |reason: CloseReason| {
            tracing::warn!(?reason, "Broker closed the data channel");
            if let Some(state) = weak.upgrade() {
                let mut state = state.lock();
                if matches!(state.channel, Some((current, _)) if current == generation) {
                    state.channel = None;
                }
            }
        });

        let transport = Transport::create_with_close(&self.readiness, on_frame, on_close)?;
        let endpoint = transport.take_send_endpoint()?;
        if let Err(e) = self.service.transfer_data_channel(endpoint) {
            transport.destroy();
            return Err(e.into());
        }
        tracing::info!(generation, "Data channel opened");
        Ok(transport)
    }

    fn close_channel(&self, state: &mut ProxyState) -> Result<()> {
        let Some((generation, transport)) = state.channel.take() else {
            return Ok(());
        };
        transport.destroy();
        match self.service.destroy_data_channel() {
            Ok(()) | Err(BrokerError::ChannelError(sensor_channel::ChannelError::Destroyed)) => {
                tracing::info!(generation, "Data channel closed");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Deliver `frame` to every live user of its sensor, outside the state lock
fn fan_out(state: &Weak<Mutex<ProxyState>>, frame: &EventFrame) {
    let Some(state) = state.upgrade() else {
        return;
    };
    let callbacks: Vec<SensorCallback> = {
        let state = state.lock();
        match state.sensors.get(&frame.identity()) {
            Some(entry) => entry
                .members
                .values()
                .filter(|m| m.is_live())
                .map(|m| Arc::clone(&m.callback))
                .collect(),
            None => return,
        }
    };
    for callback in callbacks {
        callback(frame);
    }
}

impl Drop for SubscriptionProxy {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if let Err(e) = self.close_channel(&mut state) {
            tracing::debug!("Closing data channel on drop failed: {}", e);
        }
    }
}

impl std::fmt::Debug for SubscriptionProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SubscriptionProxy")
            .field("sensors", &state.sensors.len())
            .field("channel", &state.channel.as_ref().map(|(generation, _)| *generation))
            .finish()
    }
}
