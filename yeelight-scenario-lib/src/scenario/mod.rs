use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Local, NaiveDateTime, NaiveTime};
use log::{debug, error, info, warn};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::control_interface::{ControlError, TcpConnector};
use crate::util::message::DeviceRecord;
use crate::util::traits::{BulbConnector, RecordSink};

const TIMER_FORMAT: &str = "%H:%M";

/// One rule of a schedule: from `trigger` on, the bulb should show the given
/// color temperature and brightness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    #[serde(
        rename = "timer",
        serialize_with = "serialize_timer",
        deserialize_with = "deserialize_timer"
    )]
    pub trigger: NaiveTime,
    #[serde(rename = "colorTemperature")]
    pub target_color_temperature: u32,
    #[serde(rename = "brightness")]
    pub target_brightness: u8,
}

impl ScheduleEntry {
    pub fn new(trigger: NaiveTime, target_color_temperature: u32, target_brightness: u8) -> Self {
        ScheduleEntry {
            trigger,
            target_color_temperature,
            target_brightness,
        }
    }
}

impl fmt::Display for ScheduleEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Timer: {}, Color temperature: {}K, Brightness: {}%",
            self.trigger.format(TIMER_FORMAT),
            self.target_color_temperature,
            self.target_brightness
        )
    }
}

fn serialize_timer<S>(trigger: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&trigger.format(TIMER_FORMAT).to_string())
}

fn deserialize_timer<'de, D>(deserializer: D) -> Result<NaiveTime, D::Error>
where
    D: Deserializer<'de>,
{
    let timer: String = Deserialize::deserialize(deserializer)?;
    NaiveTime::parse_from_str(&timer, TIMER_FORMAT).map_err(serde::de::Error::custom)
}

/// The schedule bound to one bulb.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(rename = "hostAddress")]
    pub device_identity: String,
    #[serde(rename = "actions", default)]
    pub entries: Vec<ScheduleEntry>,
}

impl Scenario {
    pub fn new(device_identity: &str, entries: Vec<ScheduleEntry>) -> Self {
        Scenario {
            device_identity: device_identity.to_string(),
            entries,
        }
    }

    /**
    Returns the entry that applies at `now`, if any.

    Every entry whose trigger lies strictly before `now` on the same day is a
    candidate, and later entries in the list replace earlier candidates. With
    entries listed in ascending trigger order this yields the most recently
    triggered one. The list order wins over trigger order otherwise.
    */
    pub fn evaluate(&self, now: NaiveDateTime) -> Option<&ScheduleEntry> {
        let today = now.date();
        let mut current = None;
        for entry in &self.entries {
            if now > today.and_time(entry.trigger) {
                current = Some(entry);
            }
        }
        current
    }
}

/// All scenarios, loaded once at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScenarioTable {
    scenarios: Vec<Scenario>,
}

impl ScenarioTable {
    pub fn new(scenarios: Vec<Scenario>) -> Self {
        ScenarioTable { scenarios }
    }

    pub fn scenarios(&self) -> &[Scenario] {
        &self.scenarios
    }

    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }

    /// Scenarios bound to `identity`. Matching is exact and case-sensitive.
    pub fn matching<'a>(&'a self, identity: &'a str) -> impl Iterator<Item = &'a Scenario> + 'a {
        self.scenarios
            .iter()
            .filter(move |scenario| scenario.device_identity == identity)
    }

    /// Distinct device identities in the order they first appear.
    pub fn identities(&self) -> Vec<&str> {
        let mut identities: Vec<&str> = Vec::new();
        for scenario in &self.scenarios {
            if !identities.contains(&scenario.device_identity.as_str()) {
                identities.push(&scenario.device_identity);
            }
        }
        identities
    }
}

/// What a reconciliation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// No entry has triggered yet today.
    NoApplicableEntry,
    /// The bulb already reports the scheduled values.
    InSync,
    /// Both commands went through.
    Applied(ScheduleEntry),
}

impl Outcome {
    pub fn applied(&self) -> bool {
        matches!(self, Outcome::Applied(_))
    }
}

/**
A reconciliation failed part way.

`reached` is `true` once a control session was opened: from that point on the
bulb may have taken some of the commands and its state is unknown until it
reports again.
*/
#[derive(Debug, Error)]
#[error("cannot apply scenario to {device}: {source}")]
pub struct ReconcileError {
    pub device: String,
    pub reached: bool,
    #[source]
    pub source: ControlError,
}

/// Tally of one whole-table sweep.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub applied: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub failures: Vec<ReconcileError>,
}

/**
Matches device records against the scenario table and drives bulbs towards
the scheduled values.

The engine never caches what it sent: every call compares the schedule with
the state the bulb just reported.
*/
pub struct ScenarioEngine<C = TcpConnector> {
    scenarios: Arc<ScenarioTable>,
    connector: C,
}

impl ScenarioEngine<TcpConnector> {
    pub fn with_tcp(scenarios: Arc<ScenarioTable>) -> Self {
        ScenarioEngine::new(scenarios, TcpConnector)
    }
}

impl<C> ScenarioEngine<C>
where
    C: BulbConnector,
{
    pub fn new(scenarios: Arc<ScenarioTable>, connector: C) -> Self {
        ScenarioEngine {
            scenarios,
            connector,
        }
    }

    pub fn scenarios(&self) -> &ScenarioTable {
        &self.scenarios
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Converges the bulb of `scenario` to the entry applicable at `now`.
    ///
    /// Sends `set_ct_abx` then `set_bright` over one fresh session, and only
    /// when the reported values differ from the scheduled ones.
    pub async fn reconcile(
        &self,
        scenario: &Scenario,
        record: &DeviceRecord,
        now: NaiveDateTime,
    ) -> Result<Outcome, ReconcileError> {
        let Some(entry) = scenario.evaluate(now) else {
            debug!("No entry applies to {} yet", scenario.device_identity);
            return Ok(Outcome::NoApplicableEntry);
        };
        debug!("Current entry for {}: {}", scenario.device_identity, entry);

        if entry.target_color_temperature == record.color_temperature
            && entry.target_brightness == record.brightness
        {
            return Ok(Outcome::InSync);
        }

        let failed = |reached: bool| {
            let device = scenario.device_identity.clone();
            move |source: ControlError| ReconcileError {
                device,
                reached,
                source,
            }
        };

        let mut session = self
            .connector
            .connect(&scenario.device_identity)
            .await
            .map_err(failed(false))?;
        session
            .set_color_temperature(entry.target_color_temperature)
            .await
            .map_err(failed(true))?;
        session
            .set_brightness(entry.target_brightness)
            .await
            .map_err(failed(true))?;
        session.close().await.map_err(failed(true))?;

        info!(
            "[APPLIED] {} {} Color temperature: {} Brightness: {}",
            scenario.device_identity,
            now.format("%d.%m.%Y %H:%M:%S"),
            entry.target_color_temperature,
            entry.target_brightness
        );
        Ok(Outcome::Applied(entry.clone()))
    }

    /**
    Reconciles every scenario bound to the device that sent `record`.

    Stops at the first failure. Returns how many scenarios were applied.
    */
    pub async fn refresh_scenario_state(
        &self,
        record: &DeviceRecord,
        now: NaiveDateTime,
    ) -> Result<usize, ReconcileError> {
        let mut applied = 0;
        for scenario in self.scenarios.matching(&record.identity) {
            if self.reconcile(scenario, record, now).await?.applied() {
                applied += 1;
            }
        }
        Ok(applied)
    }

    /**
    Reconciles every scenario in the table against the freshly probed
    `records`.

    A failure is recorded and the sweep carries on with the next scenario.
    Scenarios whose device did not answer the probe are skipped.
    */
    pub async fn sweep(&self, records: &[DeviceRecord], now: NaiveDateTime) -> SweepReport {
        let mut report = SweepReport::default();
        for scenario in self.scenarios.scenarios() {
            let Some(record) = records
                .iter()
                .find(|record| record.identity == scenario.device_identity)
            else {
                warn!("No probe reply from {}, skipping", scenario.device_identity);
                report.skipped += 1;
                continue;
            };
            match self.reconcile(scenario, record, now).await {
                Ok(Outcome::Applied(_)) => report.applied += 1,
                Ok(_) => report.unchanged += 1,
                Err(e) => {
                    error!("{}", e);
                    report.failures.push(e);
                }
            }
        }
        report
    }
}

#[async_trait]
impl<C> RecordSink for ScenarioEngine<C>
where
    C: BulbConnector,
{
    async fn on_record(&self, record: DeviceRecord) {
        let now = Local::now().naive_local();
        match self.refresh_scenario_state(&record, now).await {
            Ok(0) => debug!("{} needs no change", record.identity),
            Ok(applied) => debug!("Applied {} scenario(s) to {}", applied, record.identity),
            Err(e) => error!("{}", e),
        }
    }
}
