//! Shared fixtures: scripted provider, manual clock and in-memory store

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use pvoutput_backfill::downloader::{Clock, DownloadError, DownloadOrchestrator, QuotaConfig};
use pvoutput_backfill::fetcher::{
    FetchOutcome, FetchResponse, FetchUnit, Payload, ProviderClient, ProviderQuota,
};
use pvoutput_backfill::resume::{ProgressStore, ResumeState};
use pvoutput_backfill::shutdown::{SharedShutdown, ShutdownCoordinator};
use pvoutput_backfill::{DateSpan, StatusRecord, SystemId, SystemMetadata};

/// Fixed start of every test clock
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// A date in June 2023
pub fn d(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2023, 6, day).unwrap()
}

/// Span of June 2023 days
pub fn span(start: u32, end: u32) -> DateSpan {
    DateSpan::new(d(start), d(end)).unwrap()
}

/// One reading at noon on every date of the unit
pub fn rows_for(unit: &FetchUnit) -> FetchOutcome {
    let records = unit
        .span()
        .map(|span| {
            span.dates()
                .map(|date| StatusRecord::empty(date.and_hms_opt(12, 0, 0).unwrap()))
                .collect()
        })
        .unwrap_or_default();
    FetchOutcome::Data(Payload::Status(records))
}

/// Minimal metadata for a system
pub fn metadata_for(system_id: SystemId) -> SystemMetadata {
    SystemMetadata {
        system_id,
        name: format!("System {system_id}"),
        system_dc_capacity_w: Some(4500.0),
        address: "2000".to_string(),
        num_panels: Some(18),
        panel_capacity_w_each: Some(250.0),
        panel_brand: "Brand".to_string(),
        num_inverters: Some(1),
        inverter_capacity_w: Some(5000.0),
        inverter_brand: "Inverter".to_string(),
        orientation: "N".to_string(),
        array_tilt_degrees: Some(20.0),
        shade: "No".to_string(),
        install_date: None,
        latitude: Some(-33.8),
        longitude: Some(151.2),
        status_interval_minutes: Some(5),
        secondary_num_panels: None,
        secondary_panel_capacity_w_each: None,
        secondary_orientation: String::new(),
        secondary_array_tilt_degrees: None,
    }
}

type Responder = Box<dyn Fn(&FetchUnit, usize) -> FetchResponse + Send + Sync>;

/// Provider answering from a closure of (unit, times this unit was requested before)
pub struct ScriptedProvider {
    respond: Responder,
    calls: Arc<Mutex<Vec<FetchUnit>>>,
    shutdown_after: Option<(usize, SharedShutdown)>,
}

impl ScriptedProvider {
    /// Provider returning outcomes without quota headers
    pub fn new(respond: impl Fn(&FetchUnit, usize) -> FetchOutcome + Send + Sync + 'static) -> Self {
        Self::with_responses(move |unit, n| FetchResponse::new(respond(unit, n)))
    }

    /// Provider returning full responses
    pub fn with_responses(
        respond: impl Fn(&FetchUnit, usize) -> FetchResponse + Send + Sync + 'static,
    ) -> Self {
        Self {
            respond: Box::new(respond),
            calls: Arc::new(Mutex::new(Vec::new())),
            shutdown_after: None,
        }
    }

    /// Rows for every unit
    pub fn always_data() -> Self {
        Self::new(|unit, _| rows_for(unit))
    }

    /// Request shutdown while serving call number `calls` (1-based)
    pub fn shutdown_after(mut self, calls: usize, shutdown: SharedShutdown) -> Self {
        self.shutdown_after = Some((calls, shutdown));
        self
    }

    /// Handle to the call log that outlives the provider
    pub fn call_log(&self) -> Arc<Mutex<Vec<FetchUnit>>> {
        self.calls.clone()
    }

    /// Units requested so far, in order
    pub fn calls(&self) -> Vec<FetchUnit> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProviderClient for ScriptedProvider {
    async fn fetch(&self, unit: &FetchUnit) -> FetchResponse {
        let (previous, total) = {
            let mut calls = self.calls.lock().unwrap();
            let previous = calls.iter().filter(|c| *c == unit).count();
            calls.push(unit.clone());
            (previous, calls.len())
        };
        if let Some((after, shutdown)) = &self.shutdown_after {
            if total >= *after {
                shutdown.request_shutdown();
            }
        }
        (self.respond)(unit, previous)
    }
}

/// Quota headers as PVOutput sends them
pub fn provider_quota(remaining: u32, limit: u32, reset_at: DateTime<Utc>) -> Option<ProviderQuota> {
    Some(ProviderQuota {
        remaining,
        limit,
        reset_at,
    })
}

/// Clock that only moves when slept on
#[derive(Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
    sleeps: Arc<Mutex<Vec<DateTime<Utc>>>>,
}

impl ManualClock {
    /// Clock starting at [`t0`]
    pub fn new() -> Self {
        Self::at(t0())
    }

    /// Clock starting at `now`
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
            sleeps: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Move time forward
    pub fn advance(&self, by: chrono::Duration) {
        *self.now.lock().unwrap() += by;
    }

    /// Deadlines slept until, in order
    pub fn sleeps(&self) -> Vec<DateTime<Utc>> {
        self.sleeps.lock().unwrap().clone()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    async fn sleep_until(&self, deadline: DateTime<Utc>) {
        self.sleeps.lock().unwrap().push(deadline);
        let mut now = self.now.lock().unwrap();
        if deadline > *now {
            *now = deadline;
        }
    }
}

/// Store contents, shared between clones
#[derive(Default)]
pub struct StoreContents {
    /// Saved resume states
    pub states: HashMap<SystemId, ResumeState>,
    /// Rows by system and unit span; rewrites replace
    pub records: BTreeMap<(SystemId, DateSpan), Vec<StatusRecord>>,
    /// Metadata by system
    pub metadata: HashMap<SystemId, SystemMetadata>,
    /// Commit log ("records ...", "state ...")
    pub events: Vec<String>,
}

/// In-memory [`ProgressStore`]; clones share contents so a second run can resume.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<StoreContents>>,
    fail_saves: bool,
}

impl MemoryStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Store whose state saves fail
    pub fn failing() -> Self {
        Self {
            fail_saves: true,
            ..Self::default()
        }
    }

    /// Saved state of a system
    pub fn state(&self, system_id: SystemId) -> Option<ResumeState> {
        self.inner.lock().unwrap().states.get(&system_id).cloned()
    }

    /// Dates with at least one stored row
    pub fn dates_with_rows(&self, system_id: SystemId) -> Vec<NaiveDate> {
        let inner = self.inner.lock().unwrap();
        let mut dates: Vec<NaiveDate> = inner
            .records
            .iter()
            .filter(|((id, _), _)| *id == system_id)
            .flat_map(|(_, rows)| rows.iter().map(StatusRecord::date))
            .collect();
        dates.sort();
        dates.dedup();
        dates
    }

    /// Stored metadata of a system
    pub fn metadata(&self, system_id: SystemId) -> Option<SystemMetadata> {
        self.inner.lock().unwrap().metadata.get(&system_id).cloned()
    }

    /// Commit log
    pub fn events(&self) -> Vec<String> {
        self.inner.lock().unwrap().events.clone()
    }
}

impl ProgressStore for MemoryStore {
    fn load_state(&mut self, system_id: SystemId) -> Result<Option<ResumeState>, DownloadError> {
        Ok(self.state(system_id))
    }

    fn write_records(
        &mut self,
        system_id: SystemId,
        span: DateSpan,
        records: &[StatusRecord],
    ) -> Result<(), DownloadError> {
        let mut inner = self.inner.lock().unwrap();
        inner.events.push(format!("records {system_id} {span}"));
        if !records.is_empty() {
            inner.records.insert((system_id, span), records.to_vec());
        }
        Ok(())
    }

    fn write_metadata(&mut self, metadata: &SystemMetadata) -> Result<(), DownloadError> {
        let mut inner = self.inner.lock().unwrap();
        inner.events.push(format!("metadata {}", metadata.system_id));
        inner.metadata.insert(metadata.system_id, metadata.clone());
        Ok(())
    }

    fn save_state(&mut self, state: &ResumeState) -> Result<(), DownloadError> {
        if self.fail_saves {
            return Err(DownloadError::StorageError("disk full".to_string()));
        }
        let mut inner = self.inner.lock().unwrap();
        inner
            .events
            .push(format!("state {} {:?}", state.system_id(), state.cursor()));
        inner.states.insert(state.system_id(), state.clone());
        Ok(())
    }
}

/// Orchestrator over the fixtures with its own shutdown handle
pub fn orchestrator(
    provider: ScriptedProvider,
    store: MemoryStore,
    clock: ManualClock,
    max_requests: u32,
) -> (
    DownloadOrchestrator<ScriptedProvider, MemoryStore, ManualClock>,
    SharedShutdown,
) {
    let shutdown = ShutdownCoordinator::shared();
    let orchestrator = DownloadOrchestrator::new(provider, store, clock, QuotaConfig::new(max_requests))
        .with_shutdown(shutdown.clone());
    (orchestrator, shutdown)
}
