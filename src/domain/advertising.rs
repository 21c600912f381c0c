//! Advertising Controller
//!
//! Start and stop requests are submitted to the platform; the state only
//! moves when the platform acknowledges. Acks are counted against the
//! starts still in flight so late or duplicate callbacks cannot corrupt the
//! state.

use crate::domain::error::SessionError;
use crate::domain::models::{AdvertiseFailureCode, AdvertisingState};
use crate::domain::session_log::SessionLog;
use crate::domain::protocol::{advertise_interval, tx_power};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvertiseMode {
    LowPower,
    Balanced,
    LowLatency,
}

impl AdvertiseMode {
    pub fn interval(&self) -> Duration {
        let ms = match self {
            Self::LowPower => advertise_interval::LOW_POWER_MS,
            Self::Balanced => advertise_interval::BALANCED_MS,
            Self::LowLatency => advertise_interval::LOW_LATENCY_MS,
        };
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxPowerLevel {
    Low,
    Medium,
    High,
}

impl TxPowerLevel {
    pub fn dbm(&self) -> i16 {
        match self {
            Self::Low => tx_power::LOW_DBM,
            Self::Medium => tx_power::MEDIUM_DBM,
            Self::High => tx_power::HIGH_DBM,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertiseConfig {
    #[serde(default = "default_mode")]
    pub mode: AdvertiseMode,
    #[serde(default = "default_tx_power")]
    pub tx_power: TxPowerLevel,
    #[serde(default = "default_true")]
    pub connectable: bool,
    /// 0 = advertise until stopped
    #[serde(default)]
    pub timeout_ms: u64,
}

fn default_mode() -> AdvertiseMode {
    AdvertiseMode::LowLatency
}
fn default_tx_power() -> TxPowerLevel {
    TxPowerLevel::High
}
fn default_true() -> bool {
    true
}

impl Default for AdvertiseConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            tx_power: default_tx_power(),
            connectable: default_true(),
            timeout_ms: 0,
        }
    }
}

impl AdvertiseConfig {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }
}

/// Everything a backend needs to put the advertisement on air
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertiseRequest {
    pub config: AdvertiseConfig,
    pub service_uuid: Uuid,
    pub device_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartDecision {
    /// Fresh start from Idle or Failed
    Issue,
    /// Already advertising; the request is passed through again
    Reissue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Transitioned,
    /// Ack for a re-issue while already advertising
    Unchanged,
    /// Nothing was in flight (stop raced the ack); the platform should be stopped again
    Stale,
}

#[derive(Debug, Default)]
pub struct AdvertisingController {
    state: AdvertisingState,
    in_flight: u32,
}

impl AdvertisingController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> AdvertisingState {
        self.state
    }

    pub fn is_pending(&self) -> bool {
        self.in_flight > 0
    }

    pub fn request_start(&mut self, config: &AdvertiseConfig, log: &mut SessionLog) -> StartDecision {
        self.in_flight += 1;
        if self.state == AdvertisingState::Advertising {
            log.warn("Advertising already active; re-issuing start");
            return StartDecision::Reissue;
        }

        log.info(format!(
            "Starting advertisement: mode={:?} ({} ms), tx power={:?} ({} dBm), connectable={}, timeout={}",
            config.mode,
            config.mode.interval().as_millis(),
            config.tx_power,
            config.tx_power.dbm(),
            config.connectable,
            config
                .timeout()
                .map(|t| format!("{} ms", t.as_millis()))
                .unwrap_or_else(|| "none".to_string()),
        ));
        StartDecision::Issue
    }

    pub fn on_start_succeeded(&mut self, log: &mut SessionLog) -> AckOutcome {
        if self.in_flight == 0 {
            log.warn("Late advertisement confirmation after stop; stopping again");
            return AckOutcome::Stale;
        }
        self.in_flight -= 1;

        if self.state == AdvertisingState::Advertising {
            tracing::debug!("Advertisement re-issue confirmed");
            return AckOutcome::Unchanged;
        }

        self.state = AdvertisingState::Advertising;
        log.success("Advertisement started successfully");
        AckOutcome::Transitioned
    }

    pub fn on_start_failed(&mut self, code: AdvertiseFailureCode, log: &mut SessionLog) -> AckOutcome {
        if self.in_flight == 0 {
            log.warn(format!("Ignoring advertisement failure with no start pending: {}", code));
            return AckOutcome::Stale;
        }
        self.in_flight -= 1;

        if self.state == AdvertisingState::Advertising {
            log.warn(format!(
                "Advertisement re-issue rejected: {}; advertising continues",
                code
            ));
            return AckOutcome::Unchanged;
        }

        // A duplicate start rejected while the first one is still in flight
        if code == AdvertiseFailureCode::AlreadyStarted && self.in_flight > 0 {
            log.warn(format!(
                "{}; waiting for pending start",
                SessionError::AdvertiseFailure(code)
            ));
            return AckOutcome::Unchanged;
        }

        self.state = AdvertisingState::Failed(code);
        log.error(SessionError::AdvertiseFailure(code).to_string());
        AckOutcome::Transitioned
    }

    pub fn on_timed_out(&mut self, log: &mut SessionLog) -> AckOutcome {
        if self.state != AdvertisingState::Advertising {
            tracing::debug!("Advertising timeout while {}; ignored", self.state);
            return AckOutcome::Stale;
        }
        self.state = AdvertisingState::Idle;
        log.info("Advertisement timed out");
        AckOutcome::Transitioned
    }

    /// Returns whether the platform advertiser must be told to stop
    pub fn request_stop(&mut self, log: &mut SessionLog) -> bool {
        let cancelled = std::mem::take(&mut self.in_flight) > 0;

        match self.state {
            AdvertisingState::Advertising => {
                self.state = AdvertisingState::Idle;
                log.info("Advertisement stopped successfully");
                true
            }
            AdvertisingState::Failed(code) => {
                self.state = AdvertisingState::Idle;
                log.info(format!("Advertising reset after failure {}", code.code()));
                cancelled
            }
            AdvertisingState::Idle if cancelled => {
                log.info("Pending advertisement start cancelled");
                true
            }
            AdvertisingState::Idle => {
                tracing::debug!("Stop requested while idle; nothing to do");
                false
            }
        }
    }
}
