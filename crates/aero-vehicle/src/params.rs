//! Parameter table synchronisation.
//!
//! A download is a `PARAM_REQUEST_LIST` followed by a stream of `PARAM_VALUE` reports,
//! each carrying its index and the vehicle's total count. Reports can be lost or repeated,
//! so progress is counted by distinct names and the gaps are re-requested by index when
//! the stream goes quiet. A write is a `PARAM_SET` that only counts once the vehicle
//! echoes the new value back.

use aero_link::{ConcurrencyError, Fanout, LinkError, LinkSession, LinkState, PendingMap, WaitError};
use aero_proto::{Message, ParamValue, Target, PARAM_NAME_LEN};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{ProtocolError, ValidationError, VehicleError};
use crate::events::VehicleEvent;
use crate::profile::{ProfileStore, ProfileValues};

/// One entry of the local parameter table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DroneParameter {
    pub name: String,
    pub value: f32,
    /// Position in the vehicle's table, when the vehicle reported one.
    pub index: Option<u16>,
    pub min: Option<f32>,
    pub max: Option<f32>,
    pub description: Option<String>,
}

/// Range and description for a parameter, usually loaded from a config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamMetadata {
    pub name: String,
    #[serde(default)]
    pub min: Option<f32>,
    #[serde(default)]
    pub max: Option<f32>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParamSyncConfig {
    /// Quiet period after which missing entries are re-requested.
    pub download_attempt_timeout_ms: u64,
    pub download_retries: u32,
    pub write_timeout_ms: u64,
    /// Resends after the first `PARAM_SET`.
    pub write_retries: u32,
    pub read_timeout_ms: u64,
    pub read_retries: u32,
    /// Relative tolerance when matching an echoed value against the written one.
    pub epsilon: f32,
}

impl Default for ParamSyncConfig {
    fn default() -> Self {
        Self {
            download_attempt_timeout_ms: 1500,
            download_retries: 5,
            write_timeout_ms: 1000,
            write_retries: 3,
            read_timeout_ms: 1000,
            read_retries: 2,
            epsilon: 1e-6,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadSnapshot {
    pub received: usize,
    pub expected: Option<usize>,
    pub in_progress: bool,
    pub complete: bool,
}

#[derive(Debug, Default)]
pub struct ProfileApplyReport {
    pub applied: Vec<String>,
    pub unchanged: usize,
    pub failed: Vec<(String, VehicleError)>,
}

/// `a` and `b` are equal within `eps` relative to the larger magnitude (floored at 1).
pub fn values_match(a: f32, b: f32, eps: f32) -> bool {
    a == b || (a - b).abs() <= eps * a.abs().max(b.abs()).max(1.0)
}

#[derive(Debug, Default)]
struct Download {
    /// Bumped on every start and reset so a running refresh notices it was superseded.
    generation: u64,
    expected: Option<u16>,
    received: HashSet<String>,
    indices: BTreeSet<u16>,
    in_progress: bool,
    complete: bool,
}

impl Download {
    fn snapshot(&self) -> DownloadSnapshot {
        DownloadSnapshot {
            received: self.received.len(),
            expected: self.expected.map(usize::from),
            in_progress: self.in_progress,
            complete: self.complete,
        }
    }

    fn missing_indices(&self) -> Vec<u16> {
        match self.expected {
            Some(n) => (0..n).filter(|i| !self.indices.contains(i)).collect(),
            None => Vec::new(),
        }
    }
}

#[derive(Default)]
struct Table {
    params: BTreeMap<String, DroneParameter>,
    metadata: HashMap<String, ParamMetadata>,
    download: Download,
}

pub struct ParameterSyncEngine {
    session: LinkSession,
    target: Target,
    config: ParamSyncConfig,
    events: Fanout<VehicleEvent>,
    table: Mutex<Table>,
    writes: PendingMap<String, f32>,
    reads: PendingMap<String, f32>,
    activity: watch::Sender<u64>,
}

impl ParameterSyncEngine {
    pub fn new(session: LinkSession, target: Target, config: ParamSyncConfig, events: Fanout<VehicleEvent>) -> Arc<Self> {
        let (activity, _) = watch::channel(0);
        Arc::new(Self {
            session,
            target,
            config,
            events,
            table: Mutex::new(Table::default()),
            writes: PendingMap::new(),
            reads: PendingMap::new(),
            activity,
        })
    }

    /// Spawn the task feeding link traffic into the engine. Subscriptions are taken before
    /// returning, so nothing published after this call is missed.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let mut frames = self.session.subscribe();
        let mut states = self.session.subscribe_state();
        let engine = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = frames.recv() => match msg {
                        Some(msg) => {
                            if let Message::ParamValue(pv) = &*msg {
                                engine.handle_param_value(pv);
                            }
                        }
                        None => break,
                    },
                    state = states.recv() => match state {
                        Some(state @ (LinkState::Lost | LinkState::Disconnected)) => engine.on_link_down(state),
                        Some(_) => {}
                        None => break,
                    },
                }
            }
        })
    }

    pub fn config(&self) -> &ParamSyncConfig {
        &self.config
    }

    pub fn parameter(&self, name: &str) -> Option<DroneParameter> {
        self.table.lock().unwrap().params.get(name).cloned()
    }

    /// Snapshot of the table, ordered by name.
    pub fn parameters(&self) -> Vec<DroneParameter> {
        self.table.lock().unwrap().params.values().cloned().collect()
    }

    pub fn received_count(&self) -> usize {
        self.table.lock().unwrap().download.received.len()
    }

    pub fn expected_count(&self) -> Option<usize> {
        self.table.lock().unwrap().download.expected.map(usize::from)
    }

    pub fn is_download_in_progress(&self) -> bool {
        self.table.lock().unwrap().download.in_progress
    }

    pub fn is_download_complete(&self) -> bool {
        self.table.lock().unwrap().download.complete
    }

    pub fn download_snapshot(&self) -> DownloadSnapshot {
        self.table.lock().unwrap().download.snapshot()
    }

    /// Forget the table and any download state. Metadata survives.
    pub fn reset(&self) {
        let mut t = self.table.lock().unwrap();
        let generation = t.download.generation + 1;
        t.download = Download { generation, ..Default::default() };
        t.params.clear();
        drop(t);
        self.activity.send_modify(|n| *n += 1);
    }

    /// Stop a running download. The partial table is kept.
    pub fn cancel_download(&self) -> bool {
        let mut t = self.table.lock().unwrap();
        if !t.download.in_progress {
            return false;
        }
        t.download.in_progress = false;
        t.download.generation += 1;
        let snap = t.download.snapshot();
        drop(t);
        info!("params: download cancelled at {} reports", snap.received);
        self.events.publish(VehicleEvent::ParameterDownloadCompleted {
            success: false,
            received: snap.received,
            expected: snap.expected,
        });
        self.activity.send_modify(|n| *n += 1);
        true
    }

    pub fn set_metadata(&self, meta: ParamMetadata) {
        let mut t = self.table.lock().unwrap();
        if let Some(p) = t.params.get_mut(&meta.name) {
            apply_metadata(p, &meta);
        }
        t.metadata.insert(meta.name.clone(), meta);
    }

    pub fn load_metadata(&self, metas: impl IntoIterator<Item = ParamMetadata>) -> usize {
        metas.into_iter().map(|m| self.set_metadata(m)).count()
    }

    /// Download the full table. Resolves once every index up to the vehicle's count has
    /// been seen, or fails with [`ProtocolError::DownloadIncomplete`] after the retry
    /// budget is spent without progress.
    pub async fn refresh_parameters(&self) -> Result<DownloadSnapshot, VehicleError> {
        let mut activity = self.activity.subscribe();
        let generation = self.begin_download()?;
        let mut guard = DownloadGuard { engine: self, generation, started: false };

        info!("params: requesting full list");
        self.session.send(&Message::ParamRequestList { target: self.target }).await?;
        self.events.publish(VehicleEvent::ParameterDownloadStarted);
        guard.started = true;

        let window = Duration::from_millis(self.config.download_attempt_timeout_ms);
        let mut retries = 0;
        loop {
            let (snap, missing) = {
                let t = self.table.lock().unwrap();
                if t.download.generation != generation {
                    return Err(if self.session.is_connected() {
                        VehicleError::from(ProtocolError::DownloadCancelled)
                    } else {
                        VehicleError::from(LinkError::Disconnected)
                    });
                }
                (t.download.snapshot(), t.download.missing_indices())
            };
            if snap.complete {
                info!("params: download complete ({} parameters)", snap.received);
                return Ok(snap);
            }

            match tokio::time::timeout(window, activity.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(LinkError::Disconnected.into()),
                Err(_) => {}
            }

            if retries >= self.config.download_retries {
                warn!(
                    "params: download stalled at {}/{} after {} retries",
                    snap.received,
                    snap.expected.map_or("?".to_string(), |n| n.to_string()),
                    retries
                );
                self.fail_download(generation, snap);
                return Err(ProtocolError::DownloadIncomplete { received: snap.received, expected: snap.expected }.into());
            }
            retries += 1;

            if missing.is_empty() {
                debug!("params: no reports yet, re-requesting list (retry {})", retries);
                self.session.send(&Message::ParamRequestList { target: self.target }).await?;
            } else {
                debug!("params: re-requesting {} missing indices (retry {})", missing.len(), retries);
                for index in missing {
                    let Ok(index) = i16::try_from(index) else {
                        warn!("params: index {} cannot be requested by index, skipped", index);
                        continue;
                    };
                    let msg = Message::ParamRequestRead { target: self.target, index, name: String::new() };
                    self.session.send(&msg).await?;
                }
            }
        }
    }

    /// Clear the table and mark a new download as running.
    fn begin_download(&self) -> Result<u64, ConcurrencyError> {
        let mut t = self.table.lock().unwrap();
        if t.download.in_progress {
            return Err(ConcurrencyError::DownloadInProgress);
        }
        let generation = t.download.generation + 1;
        t.download = Download { generation, in_progress: true, ..Default::default() };
        t.params.clear();
        Ok(generation)
    }

    /// Write one parameter and wait for the vehicle to echo it back.
    pub async fn set_parameter(&self, name: &str, value: f32) -> Result<(), VehicleError> {
        self.validate(name, value)?;

        let eps = self.config.epsilon;
        let mut pending = self.writes.register_matching(name.to_string(), move |v| values_match(*v, value, eps))?;
        let msg = Message::ParamSet { target: self.target, name: name.to_string(), value };
        let timeout = Duration::from_millis(self.config.write_timeout_ms);
        let attempts = self.config.write_retries + 1;

        for attempt in 1..=attempts {
            self.session.send(&msg).await?;
            match pending.wait(timeout).await {
                Ok(echoed) => {
                    info!("params: {} = {} confirmed", name, echoed);
                    self.events.publish(VehicleEvent::ParameterUpdated { name: name.to_string() });
                    return Ok(());
                }
                Err(WaitError::Timeout) => debug!("params: {} not confirmed (attempt {}/{})", name, attempt, attempts),
                Err(WaitError::Link(e)) => return Err(e.into()),
            }
        }
        warn!("params: giving up on {} after {} attempts", name, attempts);
        Err(ProtocolError::WriteNotConfirmed { name: name.to_string(), attempts }.into())
    }

    /// Ask the vehicle for the current value of `name` and update the table with it.
    pub async fn read_parameter(&self, name: &str) -> Result<DroneParameter, VehicleError> {
        validate_name(name)?;
        let mut pending = self.reads.register(name.to_string())?;
        let msg = Message::ParamRequestRead { target: self.target, index: -1, name: name.to_string() };
        let timeout = Duration::from_millis(self.config.read_timeout_ms);

        for _ in 0..=self.config.read_retries {
            self.session.send(&msg).await?;
            match pending.wait(timeout).await {
                Ok(_) => {
                    // The table was updated before the waiter was woken.
                    return self
                        .parameter(name)
                        .ok_or_else(|| ProtocolError::ReadNotAnswered(name.to_string()).into());
                }
                Err(WaitError::Timeout) => {}
                Err(WaitError::Link(e)) => return Err(e.into()),
            }
        }
        Err(ProtocolError::ReadNotAnswered(name.to_string()).into())
    }

    /// Store the current table under `profile`.
    pub fn save_profile(&self, store: &dyn ProfileStore, profile: &str) -> Result<usize, VehicleError> {
        let values: ProfileValues = self.table.lock().unwrap().params.values().map(|p| (p.name.clone(), p.value)).collect();
        store.save_profile(profile, &values)?;
        info!("params: saved {} values to profile {}", values.len(), profile);
        Ok(values.len())
    }

    /// Write every value of `profile` that differs from the table. Individual failures are
    /// collected rather than aborting the rest.
    pub async fn apply_profile(&self, store: &dyn ProfileStore, profile: &str) -> Result<ProfileApplyReport, VehicleError> {
        let values = store.load_profile(profile)?;
        let mut report = ProfileApplyReport::default();
        for (name, value) in values {
            let current = self.parameter(&name).map(|p| p.value);
            if current.is_some_and(|c| values_match(c, value, self.config.epsilon)) {
                report.unchanged += 1;
                continue;
            }
            match self.set_parameter(&name, value).await {
                Ok(()) => report.applied.push(name),
                Err(e @ VehicleError::Link(_)) => return Err(e),
                Err(e) => {
                    warn!("params: profile {}: {} not applied: {}", profile, name, e);
                    report.failed.push((name, e));
                }
            }
        }
        Ok(report)
    }

    fn validate(&self, name: &str, value: f32) -> Result<(), ValidationError> {
        validate_name(name)?;
        if !value.is_finite() {
            return Err(ValidationError::NotFinite { name: name.to_string(), value });
        }
        let t = self.table.lock().unwrap();
        let (min, max) = match t.params.get(name) {
            Some(p) => (p.min, p.max),
            None => t.metadata.get(name).map_or((None, None), |m| (m.min, m.max)),
        };
        let lo = min.unwrap_or(f32::NEG_INFINITY);
        let hi = max.unwrap_or(f32::INFINITY);
        if value < lo || value > hi {
            return Err(ValidationError::OutOfRange { name: name.to_string(), value, min: lo, max: hi });
        }
        Ok(())
    }

    fn handle_param_value(&self, pv: &ParamValue) {
        let mut events = Vec::new();
        {
            let mut guard = self.table.lock().unwrap();
            let t = &mut *guard;
            let dl = &mut t.download;

            // Only a running download fixes the total; echoes outside one are just stored.
            let total = if dl.in_progress { Some(*dl.expected.get_or_insert(pv.count)) } else { dl.expected };
            if let Some(total) = total.filter(|&n| n != pv.count) {
                warn!("params: {} reports total {}, expected {}; ignored", pv.name, pv.count, total);
                return;
            }

            let mut counted = false;
            if let (true, Some(total)) = (dl.in_progress, total) {
                if pv.index < total {
                    dl.indices.insert(pv.index);
                }
                if !dl.received.contains(&pv.name) {
                    if dl.received.len() < usize::from(total) {
                        dl.received.insert(pv.name.clone());
                        counted = true;
                    } else {
                        warn!("params: {} is beyond the reported total {}", pv.name, total);
                    }
                }
            }

            let index = (pv.index < pv.count).then_some(pv.index);
            let changed = match t.params.get_mut(&pv.name) {
                Some(p) => {
                    let changed = p.value != pv.value;
                    p.value = pv.value;
                    p.index = index.or(p.index);
                    changed
                }
                None => {
                    let mut p = DroneParameter {
                        name: pv.name.clone(),
                        value: pv.value,
                        index,
                        min: None,
                        max: None,
                        description: None,
                    };
                    if let Some(meta) = t.metadata.get(&pv.name) {
                        apply_metadata(&mut p, meta);
                    }
                    t.params.insert(pv.name.clone(), p);
                    true
                }
            };

            let dl = &mut t.download;
            let received = dl.received.len();
            if counted {
                let expected = dl.expected.map_or(received, usize::from);
                events.push(VehicleEvent::ParameterUpdated { name: pv.name.clone() });
                events.push(VehicleEvent::ParameterDownloadProgress { received, expected });
                if received == expected {
                    dl.complete = true;
                    dl.in_progress = false;
                    events.push(VehicleEvent::ParameterDownloadCompleted {
                        success: true,
                        received,
                        expected: Some(expected),
                    });
                }
            } else if changed && !self.writes.is_pending(&pv.name) {
                events.push(VehicleEvent::ParameterUpdated { name: pv.name.clone() });
            }
        }

        for ev in events {
            self.events.publish(ev);
        }
        self.writes.resolve(&pv.name, pv.value);
        self.reads.resolve(&pv.name, pv.value);
        self.activity.send_modify(|n| *n += 1);
    }

    fn on_link_down(&self, state: LinkState) {
        let was_downloading = self.is_download_in_progress();
        self.reset();
        let writes = self.writes.fail_all(LinkError::Disconnected);
        let reads = self.reads.fail_all(LinkError::Disconnected);
        if was_downloading || writes + reads > 0 {
            info!("params: link {:?}, dropped table and {} pending requests", state, writes + reads);
        }
        if was_downloading {
            self.events.publish(VehicleEvent::ParameterDownloadCompleted { success: false, received: 0, expected: None });
        }
    }

    fn fail_download(&self, generation: u64, snap: DownloadSnapshot) {
        let mut t = self.table.lock().unwrap();
        if t.download.generation == generation {
            t.download.in_progress = false;
        }
        drop(t);
        self.events.publish(VehicleEvent::ParameterDownloadCompleted {
            success: false,
            received: snap.received,
            expected: snap.expected,
        });
    }
}

/// Ends a refresh that returns or is dropped while its download is still marked running.
/// Once the start event went out, a matching failed completion follows.
struct DownloadGuard<'a> {
    engine: &'a ParameterSyncEngine,
    generation: u64,
    started: bool,
}

impl Drop for DownloadGuard<'_> {
    fn drop(&mut self) {
        let snap = match self.engine.table.lock() {
            Ok(mut t) if t.download.generation == self.generation && t.download.in_progress => {
                t.download.in_progress = false;
                t.download.snapshot()
            }
            _ => return,
        };
        if self.started {
            self.engine.events.publish(VehicleEvent::ParameterDownloadCompleted {
                success: false,
                received: snap.received,
                expected: snap.expected,
            });
        }
    }
}

fn validate_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() || name.len() > PARAM_NAME_LEN || name.contains('\0') {
        return Err(ValidationError::InvalidName(name.to_string()));
    }
    Ok(())
}

fn apply_metadata(p: &mut DroneParameter, meta: &ParamMetadata) {
    p.min = meta.min;
    p.max = meta.max;
    p.description = meta.description.clone();
}
