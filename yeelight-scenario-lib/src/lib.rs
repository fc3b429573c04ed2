//! # Yeelight Scenario Library
//!
//! `yeelight-scenario-lib` keeps LAN smart bulbs in line with a time-of-day
//! lighting schedule. It listens for the announcements bulbs multicast on the
//! local network, works out which scheduled setting applies right now, and
//! sends control commands to any bulb that reports something else.
//!
//! ## Features
//!
//! - Decoding of `NOTIFY` announcements and `M-SEARCH` replies
//! - A control session for the JSON-over-TCP bulb protocol, with parameter clamping
//! - Schedule evaluation and idempotent reconciliation
//! - A cancellable, debounced multicast listener and a one-shot prober
//! - An orchestrator alternating between listening and probing
//!
//! ## Example
//!
//! Probe a single bulb and bring it in line with a schedule:
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use chrono::{Local, NaiveTime};
//! use yeelight_scenario_lib::scenario::{Scenario, ScenarioEngine, ScenarioTable, ScheduleEntry};
//! use yeelight_scenario_lib::util::discovery::probe_once;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let evening = ScheduleEntry::new(NaiveTime::from_hms_opt(18, 0, 0).unwrap(), 2700, 20);
//!     let table = ScenarioTable::new(vec![Scenario::new("192.168.1.239", vec![evening])]);
//!     let engine = ScenarioEngine::with_tcp(Arc::new(table));
//!
//!     let record = probe_once("0.0.0.0:8001", "192.168.1.239:1982").await?;
//!     engine.refresh_scenario_state(&record, Local::now().naive_local()).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Disclaimer
//!
//! This project is not affiliated with, authorized by, endorsed by, or in any way officially connected
//! with Yeelight or its affiliates.
//!
//! ## License
//!
//! This project is dual-licensed under the MIT License and the Apache License, Version 2.0.
//! You may choose to use either license, depending on your project needs.

// The `config` module holds the network parameters and the YAML decoding of
// the scenario list.
pub mod config;

// The `control_interface` module provides the control session used to send
// commands to a single bulb.
//
// Example usage:
//
// ```
// use yeelight_scenario_lib::control_interface::ControlSession;
//
// #[tokio::main]
// async fn main() {
//     let mut session = ControlSession::open("192.168.1.239").await.unwrap();
//     session.set_brightness(40).await.unwrap();
//     session.close().await.unwrap();
// }
// ```
pub mod control_interface;

// The `orchestrator` module alternates the listening and probing phases.
pub mod orchestrator;

// The `scenario` module evaluates schedules and reconciles bulbs against them.
pub mod scenario;

// The `util` module contains the discovery message parser, the listener, the
// prober and the traits that connect them to the scenario engine.
pub mod util;

#[cfg(test)]
mod test_helper;
