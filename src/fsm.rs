//! Ship FSM (spec §4.6), grounded in `original_source/.../core/ship_fsm_handler.py` and its test
//! suite (`test_safe_mode_fsm.py`, `test_ship_fsm_docking_validation.py`,
//! `test_ship_fsm_handler_docking.py`). Safe Mode supervises every other state: a failing BIOS
//! or stale sensors force entry from anywhere, and exit requires `safe_exit_confirmation_count`
//! consecutive all-ok ticks, with any failing tick resetting the counter to zero.

use crate::config::FsmConfig;
use crate::event_store::{EventStore, TruthState};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShipState {
    ShipStartup,
    ShipIdle,
    FlightCruise,
    FlightManeuvering,
    DockingApproach,
    DockingEngaged,
    SafeMode,
}

impl ShipState {
    fn as_str(self) -> &'static str {
        match self {
            ShipState::ShipStartup => "SHIP_STARTUP",
            ShipState::ShipIdle => "SHIP_IDLE",
            ShipState::FlightCruise => "FLIGHT_CRUISE",
            ShipState::FlightManeuvering => "FLIGHT_MANEUVERING",
            ShipState::DockingApproach => "DOCKING_APPROACH",
            ShipState::DockingEngaged => "DOCKING_ENGAGED",
            ShipState::SafeMode => "SAFE_MODE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionStatus {
    Success,
    Pending,
    Failure,
}

#[derive(Debug, Clone)]
pub struct TransitionRecord {
    pub from_state: ShipState,
    pub to_state: ShipState,
    pub trigger_event: String,
    pub status: TransitionStatus,
}

#[derive(Debug, Clone, Copy)]
pub enum FsmCommand {
    RequestCruise,
    RequestManeuvering,
    RequestDockingApproach,
    RequestIdle,
}

/// Everything the FSM needs to decide this tick's transition. Built by the pipeline from the
/// Health Monitor (`bios_ok`, `sensors_ok`), the plugin-backed provider layer (`provider_ok`),
/// and the radar/guard layer (docking fields).
#[derive(Debug, Clone, Default)]
pub struct TickInputs {
    pub bios_ok: bool,
    pub sensors_ok: bool,
    pub provider_ok: bool,
    pub docking_target_in_range: bool,
    pub docking_track_age_s: Option<f64>,
    pub docking_track_quality: Option<f64>,
    pub docking_engaged: bool,
    pub command: Option<FsmCommand>,
}

impl TickInputs {
    fn docking_track_valid(&self, cfg: &crate::config::SensorConfig) -> Option<bool> {
        match (self.docking_track_age_s, self.docking_track_quality) {
            (Some(age), Some(quality)) => Some(age <= cfg.max_age_s && quality >= cfg.min_quality),
            _ => None,
        }
    }
}

pub struct ShipFsm {
    state: ShipState,
    docking_confirm_hits: u32,
    safe_mode_exit_hits: u32,
    safe_mode_reason: Option<String>,
    fsm_cfg: FsmConfig,
    sensor_cfg: crate::config::SensorConfig,
}

impl ShipFsm {
    pub fn new(fsm_cfg: FsmConfig, sensor_cfg: crate::config::SensorConfig) -> Self {
        Self {
            state: ShipState::ShipStartup,
            docking_confirm_hits: 0,
            safe_mode_exit_hits: 0,
            safe_mode_reason: None,
            fsm_cfg,
            sensor_cfg,
        }
    }

    pub fn state(&self) -> ShipState {
        self.state
    }

    fn emit(
        &self,
        event_store: Option<&EventStore>,
        record: &TransitionRecord,
        now_ts: f64,
    ) {
        if let Some(store) = event_store {
            let _ = store.append(
                "FSM",
                "FSM_TRANSITION",
                serde_json::json!({
                    "from_state": record.from_state.as_str(),
                    "to_state": record.to_state.as_str(),
                    "trigger_event": record.trigger_event,
                }),
                TruthState::Ok,
                record.trigger_event.clone(),
                Some(now_ts),
            );
        }
    }

    fn emit_safe_mode(&self, event_store: Option<&EventStore>, action: &str, reason: &str, now_ts: f64) {
        if let Some(store) = event_store {
            let _ = store.append(
                "SAFE_MODE",
                "SAFE_MODE",
                serde_json::json!({"action": action}),
                TruthState::Ok,
                reason,
                Some(now_ts),
            );
        }
    }

    fn transition(
        &mut self,
        to: ShipState,
        trigger_event: impl Into<String>,
        status: TransitionStatus,
        event_store: Option<&EventStore>,
        now_ts: f64,
    ) -> TransitionRecord {
        let record = TransitionRecord {
            from_state: self.state,
            to_state: to,
            trigger_event: trigger_event.into(),
            status,
        };
        self.state = to;
        self.emit(event_store, &record, now_ts);
        record
    }

    fn hold(
        &self,
        trigger_event: impl Into<String>,
        status: TransitionStatus,
        event_store: Option<&EventStore>,
        now_ts: f64,
    ) -> TransitionRecord {
        let record = TransitionRecord {
            from_state: self.state,
            to_state: self.state,
            trigger_event: trigger_event.into(),
            status,
        };
        self.emit(event_store, &record, now_ts);
        record
    }

    /// Advance the FSM by one tick. Safe Mode entry/exit takes priority over every other rule.
    pub fn step(
        &mut self,
        inputs: &TickInputs,
        now_ts: f64,
        event_store: Option<&EventStore>,
    ) -> TransitionRecord {
        if self.state != ShipState::SafeMode {
            if !inputs.bios_ok {
                self.safe_mode_reason = Some("BIOS_UNAVAILABLE".into());
                self.safe_mode_exit_hits = 0;
                self.emit_safe_mode(event_store, "enter", "BIOS_UNAVAILABLE", now_ts);
                return self.transition(
                    ShipState::SafeMode,
                    "SAFE_MODE_ENTER_BIOS_UNAVAILABLE",
                    TransitionStatus::Success,
                    event_store,
                    now_ts,
                );
            }
            if !inputs.sensors_ok {
                self.safe_mode_reason = Some("SENSORS_STALE".into());
                self.safe_mode_exit_hits = 0;
                self.emit_safe_mode(event_store, "enter", "SENSORS_STALE", now_ts);
                return self.transition(
                    ShipState::SafeMode,
                    "SAFE_MODE_ENTER_SENSORS_STALE",
                    TransitionStatus::Success,
                    event_store,
                    now_ts,
                );
            }
        } else {
            if !inputs.provider_ok {
                self.safe_mode_exit_hits = 0;
                self.emit_safe_mode(event_store, "hold", "PROVIDER_UNAVAILABLE", now_ts);
                return self.hold(
                    "SAFE_MODE_HOLD_PROVIDER_UNAVAILABLE",
                    TransitionStatus::Pending,
                    event_store,
                    now_ts,
                );
            }

            self.safe_mode_exit_hits += 1;
            if self.safe_mode_exit_hits >= self.fsm_cfg.safe_exit_confirmation_count {
                self.safe_mode_exit_hits = 0;
                let reason = self.safe_mode_reason.take().unwrap_or_default();
                self.emit_safe_mode(event_store, "exit", &reason, now_ts);
                return self.transition(
                    ShipState::ShipIdle,
                    "SAFE_MODE_EXIT_CONFIRMED",
                    TransitionStatus::Success,
                    event_store,
                    now_ts,
                );
            }
            return self.hold(
                format!(
                    "SAFE_MODE_RECOVERING_{}_OF_{}",
                    self.safe_mode_exit_hits, self.fsm_cfg.safe_exit_confirmation_count
                ),
                TransitionStatus::Pending,
                event_store,
                now_ts,
            );
        }

        match self.state {
            ShipState::ShipStartup => self.transition(
                ShipState::ShipIdle,
                "STARTUP_COMPLETE",
                TransitionStatus::Success,
                event_store,
                now_ts,
            ),
            ShipState::DockingApproach => self.step_docking(inputs, now_ts, event_store),
            _ => self.step_command(inputs, now_ts, event_store),
        }
    }

    fn step_command(
        &mut self,
        inputs: &TickInputs,
        now_ts: f64,
        event_store: Option<&EventStore>,
    ) -> TransitionRecord {
        match (self.state, inputs.command) {
            (ShipState::ShipIdle, Some(FsmCommand::RequestCruise)) => self.transition(
                ShipState::FlightCruise,
                "CRUISE_ENGAGED",
                TransitionStatus::Success,
                event_store,
                now_ts,
            ),
            (ShipState::FlightCruise, Some(FsmCommand::RequestManeuvering)) => self.transition(
                ShipState::FlightManeuvering,
                "MANEUVERING_ENGAGED",
                TransitionStatus::Success,
                event_store,
                now_ts,
            ),
            (ShipState::FlightManeuvering, Some(FsmCommand::RequestCruise)) => self.transition(
                ShipState::FlightCruise,
                "CRUISE_RESUMED",
                TransitionStatus::Success,
                event_store,
                now_ts,
            ),
            (
                ShipState::FlightCruise | ShipState::FlightManeuvering,
                Some(FsmCommand::RequestDockingApproach),
            ) => {
                self.docking_confirm_hits = 0;
                self.transition(
                    ShipState::DockingApproach,
                    "DOCKING_APPROACH_INITIATED",
                    TransitionStatus::Success,
                    event_store,
                    now_ts,
                )
            }
            (ShipState::DockingEngaged, Some(FsmCommand::RequestIdle)) => {
                if let Some(store) = event_store {
                    let _ = store.append(
                        "ACTUATORS",
                        "ACTUATION_RECEIPT",
                        serde_json::json!({"command": "UNDOCK"}),
                        TruthState::Ok,
                        "COMMAND_ACCEPTED_NO_EXECUTION_ACK",
                        Some(now_ts),
                    );
                }
                self.transition(
                    ShipState::ShipIdle,
                    "UNDOCK_COMPLETE",
                    TransitionStatus::Success,
                    event_store,
                    now_ts,
                )
            }
            _ => self.hold("NO_OP", TransitionStatus::Success, event_store, now_ts),
        }
    }

    fn step_docking(
        &mut self,
        inputs: &TickInputs,
        now_ts: f64,
        event_store: Option<&EventStore>,
    ) -> TransitionRecord {
        if inputs.docking_engaged {
            self.docking_confirm_hits = 0;
            if let Some(store) = event_store {
                let _ = store.append(
                    "ACTUATORS",
                    "ACTUATION_RECEIPT",
                    serde_json::json!({"command": "DOCK"}),
                    TruthState::Ok,
                    "COMMAND_ACCEPTED_NO_EXECUTION_ACK",
                    Some(now_ts),
                );
            }
            return self.transition(
                ShipState::DockingEngaged,
                "DOCKING_COMPLETE",
                TransitionStatus::Success,
                event_store,
                now_ts,
            );
        }

        if !inputs.docking_target_in_range {
            self.docking_confirm_hits = 0;
            return self.transition(
                ShipState::FlightManeuvering,
                "DOCKING_TARGET_LOST",
                TransitionStatus::Failure,
                event_store,
                now_ts,
            );
        }

        let valid = inputs.docking_track_valid(&self.sensor_cfg);
        let (ok, reason) = match valid {
            None => (false, "NO_DATA"),
            Some(true) => (true, "OK"),
            Some(false) => (false, "STALE_OR_LOW_QUALITY"),
        };
        if let Some(store) = event_store {
            let _ = store.append(
                "SENSORS",
                "SENSOR_TRUST_VERDICT",
                serde_json::json!({"sensor_kind": "docking_radar", "ok": ok}),
                if ok { TruthState::Ok } else { TruthState::NoData },
                reason,
                Some(now_ts),
            );
        }

        if !ok {
            self.docking_confirm_hits = 0;
            return self.hold(
                "DOCKING_SENSOR_VALIDATION_FAILED",
                TransitionStatus::Failure,
                event_store,
                now_ts,
            );
        }

        self.docking_confirm_hits += 1;
        if self.docking_confirm_hits >= self.fsm_cfg.docking_confirmation_count {
            self.docking_confirm_hits = 0;
            return self.transition(
                ShipState::DockingEngaged,
                "DOCKING_CONFIRMED",
                TransitionStatus::Success,
                event_store,
                now_ts,
            );
        }
        self.hold(
            format!(
                "DOCKING_CONFIRMING_{}_OF_{}",
                self.docking_confirm_hits, self.fsm_cfg.docking_confirmation_count
            ),
            TransitionStatus::Pending,
            event_store,
            now_ts,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SensorConfig;

    fn fsm() -> ShipFsm {
        let fsm_cfg = FsmConfig {
            docking_confirmation_count: 3,
            safe_exit_confirmation_count: 3,
        };
        let sensor_cfg = SensorConfig { max_age_s: 2.0, min_quality: 0.5 };
        let mut fsm = ShipFsm::new(fsm_cfg, sensor_cfg);
        fsm.state = ShipState::ShipIdle; // skip startup for these tests
        fsm
    }

    fn ok_inputs() -> TickInputs {
        TickInputs {
            bios_ok: true,
            sensors_ok: true,
            provider_ok: true,
            ..Default::default()
        }
    }

    #[test]
    fn bios_unavailable_forces_safe_mode_from_anywhere() {
        let mut fsm = fsm();
        fsm.state = ShipState::FlightCruise;
        let mut inputs = ok_inputs();
        inputs.bios_ok = false;
        let record = fsm.step(&inputs, 0.0, None);
        assert_eq!(record.to_state, ShipState::SafeMode);
        assert_eq!(record.trigger_event, "SAFE_MODE_ENTER_BIOS_UNAVAILABLE");
    }

    #[test]
    fn safe_mode_exit_requires_n_consecutive_ok_ticks() {
        let mut fsm = fsm();
        fsm.state = ShipState::SafeMode;
        let inputs = ok_inputs();

        let r1 = fsm.step(&inputs, 0.0, None);
        assert_eq!(r1.trigger_event, "SAFE_MODE_RECOVERING_1_OF_3");
        assert_eq!(r1.to_state, ShipState::SafeMode);

        let r2 = fsm.step(&inputs, 1.0, None);
        assert_eq!(r2.trigger_event, "SAFE_MODE_RECOVERING_2_OF_3");

        let r3 = fsm.step(&inputs, 2.0, None);
        assert_eq!(r3.trigger_event, "SAFE_MODE_EXIT_CONFIRMED");
        assert_eq!(r3.to_state, ShipState::ShipIdle);
    }

    #[test]
    fn safe_mode_flapping_resets_exit_counter() {
        let mut fsm = fsm();
        fsm.state = ShipState::SafeMode;
        let mut inputs = ok_inputs();

        let r1 = fsm.step(&inputs, 0.0, None);
        assert_eq!(r1.trigger_event, "SAFE_MODE_RECOVERING_1_OF_3");

        inputs.provider_ok = false;
        let r2 = fsm.step(&inputs, 1.0, None);
        assert_eq!(r2.trigger_event, "SAFE_MODE_HOLD_PROVIDER_UNAVAILABLE");
        assert_eq!(fsm.safe_mode_exit_hits, 0);

        inputs.provider_ok = true;
        let r3 = fsm.step(&inputs, 2.0, None);
        assert_eq!(r3.trigger_event, "SAFE_MODE_RECOVERING_1_OF_3");
    }

    #[test]
    fn docking_confirms_after_three_valid_cycles() {
        let mut fsm = fsm();
        fsm.state = ShipState::DockingApproach;
        let mut inputs = ok_inputs();
        inputs.docking_target_in_range = true;
        inputs.docking_track_age_s = Some(0.1);
        inputs.docking_track_quality = Some(0.9);

        assert_eq!(fsm.step(&inputs, 0.0, None).trigger_event, "DOCKING_CONFIRMING_1_OF_3");
        assert_eq!(fsm.step(&inputs, 1.0, None).trigger_event, "DOCKING_CONFIRMING_2_OF_3");
        let r3 = fsm.step(&inputs, 2.0, None);
        assert_eq!(r3.trigger_event, "DOCKING_CONFIRMED");
        assert_eq!(r3.to_state, ShipState::DockingEngaged);
    }

    #[test]
    fn docking_target_lost_returns_to_maneuvering() {
        let mut fsm = fsm();
        fsm.state = ShipState::DockingApproach;
        let mut inputs = ok_inputs();
        inputs.docking_target_in_range = false;
        let record = fsm.step(&inputs, 0.0, None);
        assert_eq!(record.to_state, ShipState::FlightManeuvering);
        assert_eq!(record.trigger_event, "DOCKING_TARGET_LOST");
    }

    #[test]
    fn stale_docking_track_does_not_advance_counter() {
        let mut fsm = fsm();
        fsm.state = ShipState::DockingApproach;
        let mut inputs = ok_inputs();
        inputs.docking_target_in_range = true;
        inputs.docking_track_age_s = Some(20.0);
        inputs.docking_track_quality = Some(0.9);
        let record = fsm.step(&inputs, 0.0, None);
        assert_eq!(record.trigger_event, "DOCKING_SENSOR_VALIDATION_FAILED");
        assert_eq!(fsm.docking_confirm_hits, 0);
    }

    #[test]
    fn docking_flapping_resets_confirm_counter() {
        let mut fsm = fsm();
        fsm.state = ShipState::DockingApproach;
        let mut inputs = ok_inputs();
        inputs.docking_target_in_range = true;
        inputs.docking_track_age_s = Some(0.1);
        inputs.docking_track_quality = Some(0.9);

        assert_eq!(fsm.step(&inputs, 0.0, None).trigger_event, "DOCKING_CONFIRMING_1_OF_3");

        inputs.docking_track_quality = Some(0.1); // below min_quality
        let r2 = fsm.step(&inputs, 1.0, None);
        assert_eq!(r2.trigger_event, "DOCKING_SENSOR_VALIDATION_FAILED");
        assert_eq!(fsm.docking_confirm_hits, 0);

        inputs.docking_track_quality = Some(0.9);
        let r3 = fsm.step(&inputs, 2.0, None);
        assert_eq!(r3.trigger_event, "DOCKING_CONFIRMING_1_OF_3");
    }
}
