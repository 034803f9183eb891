//! Cooking phase state machine.
//!
//! A session owns an ordered list of phases (preheat, load_recover, smoke,
//! stall, finish_hold). The active phase's target temperature is the live
//! setpoint. Completion conditions are evaluated once per control tick; the
//! first satisfied condition marks the session pending, and the actual
//! transition waits for explicit user approval.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::db::{SmokePhase, Store};
use crate::ControllerError;
use protocol::PhaseSnapshot;

/// Completion-condition bag stored as JSON on each phase. Any subset may be
/// present; conditions are checked in declaration order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionConditions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_duration_min: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stability_range_f: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stability_duration_min: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub meat_temp_threshold_f: Option<f64>,
}

impl CompletionConditions {
    pub fn parse(json: &str) -> Self {
        serde_json::from_str(json).unwrap_or_else(|e| {
            warn!("Unparseable completion conditions ({e}); treating as empty");
            Self::default()
        })
    }
}

/// Per-condition progress for status display.
#[derive(Debug, Clone, Serialize)]
pub struct ConditionProgress {
    pub kind: &'static str,
    pub progress: f64,
    pub current: f64,
    pub target: f64,
    pub met: bool,
}

/// Phase progress summary.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseProgress {
    pub phase_name: String,
    pub phase_order: i64,
    pub target_temp_f: f64,
    pub duration_minutes: f64,
    pub overall_progress: f64,
    pub factors: Vec<ConditionProgress>,
}

const STALL_WINDOW_MIN: i64 = 45;
const STALL_MIN_HISTORY_MIN: i64 = 30;
const STALL_BAND_LO_F: f64 = 140.0;
const STALL_BAND_HI_F: f64 = 180.0;
const STALL_RISE_F: f64 = 2.0;
const HISTORY_CAP: usize = 4096;

/// Drives phase evaluation and transitions for active sessions.
///
/// The in-memory stability and meat-temperature histories are keyed by smoke
/// id; they are advisory state and safe to lose on restart.
pub struct PhaseManager {
    stability: HashMap<i64, VecDeque<(DateTime<Utc>, f64)>>,
    meat_history: HashMap<i64, VecDeque<(DateTime<Utc>, f64)>>,
}

impl Default for PhaseManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseManager {
    pub fn new() -> Self {
        Self {
            stability: HashMap::new(),
            meat_history: HashMap::new(),
        }
    }

    /// Evaluates the active phase's completion conditions. Returns the
    /// reason string when a condition is satisfied. Paused phases and
    /// sessions already pending are skipped by the caller.
    pub async fn check_conditions(
        &mut self,
        store: &Store,
        smoke_id: i64,
        current_temp_f: f64,
        meat_temp_f: Option<f64>,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, ControllerError> {
        let phase = match store.current_phase(smoke_id).await? {
            Some(p) => p,
            None => return Ok(None),
        };

        let conditions = CompletionConditions::parse(&phase.completion_conditions);
        let started = phase.started_at.unwrap_or(now);
        let phase_minutes = (now - started).num_seconds() as f64 / 60.0;

        if let Some(max_min) = conditions.max_duration_min {
            if phase_minutes >= max_min {
                info!(
                    "Phase {} hit max duration ({:.1} min)",
                    phase.phase_name, phase_minutes
                );
                return Ok(Some(format!(
                    "Maximum duration of {max_min:.0} minutes reached"
                )));
            }
        }

        if let (Some(range_f), Some(duration_min)) =
            (conditions.stability_range_f, conditions.stability_duration_min)
        {
            if self.track_stability(
                smoke_id,
                current_temp_f,
                phase.target_temp_f,
                range_f,
                duration_min,
                now,
            ) {
                info!("Phase {} reached temperature stability", phase.phase_name);
                return Ok(Some(format!(
                    "Temperature stable at {:.0}\u{00B0}F \u{00B1}{:.0}\u{00B0}F for {:.0} minutes",
                    phase.target_temp_f, range_f, duration_min
                )));
            }
        }

        if let (Some(threshold_f), Some(meat_f)) = (conditions.meat_temp_threshold_f, meat_temp_f) {
            if meat_f >= threshold_f {
                info!(
                    "Phase {} meat threshold reached ({:.1}F)",
                    phase.phase_name, meat_f
                );
                return Ok(Some(format!("Meat temperature reached {meat_f:.1}\u{00B0}F")));
            }
        }

        Ok(None)
    }

    /// Records a control-temperature sample and reports whether the
    /// temperature has stayed within the band continuously for the full
    /// duration. Out-of-band samples are not dropped; they age out.
    fn track_stability(
        &mut self,
        smoke_id: i64,
        temp_f: f64,
        target_f: f64,
        range_f: f64,
        duration_min: f64,
        now: DateTime<Utc>,
    ) -> bool {
        let history = self.stability.entry(smoke_id).or_default();

        history.push_back((now, temp_f));
        if history.len() > HISTORY_CAP {
            history.pop_front();
        }

        let window = Duration::seconds((duration_min * 60.0) as i64);
        let cutoff = now - window;
        while history.front().is_some_and(|(t, _)| *t < cutoff) {
            history.pop_front();
        }

        let oldest = match history.front() {
            Some((t, _)) => *t,
            None => return false,
        };
        if now - oldest < window {
            return false;
        }

        history
            .iter()
            .all(|(_, t)| (*t - target_f).abs() <= range_f)
    }

    /// Advisory stall detection: in the 140–180 °F band, a meat-temperature
    /// rise under 2 °F across the trailing window flags a stall. It never
    /// triggers a transition by itself.
    pub fn detect_stall(
        &mut self,
        smoke_id: i64,
        meat_temp_f: Option<f64>,
        now: DateTime<Utc>,
    ) -> bool {
        let meat_f = match meat_temp_f {
            Some(t) => t,
            None => return false,
        };

        if !(STALL_BAND_LO_F..=STALL_BAND_HI_F).contains(&meat_f) {
            return false;
        }

        let history = self.meat_history.entry(smoke_id).or_default();
        history.push_back((now, meat_f));
        if history.len() > HISTORY_CAP {
            history.pop_front();
        }

        let cutoff = now - Duration::minutes(STALL_WINDOW_MIN);
        while history.front().is_some_and(|(t, _)| *t < cutoff) {
            history.pop_front();
        }

        let (oldest_ts, oldest_temp) = match history.front() {
            Some(pair) => *pair,
            None => return false,
        };
        if now - oldest_ts < Duration::minutes(STALL_MIN_HISTORY_MIN) {
            return false;
        }

        let rise = meat_f - oldest_temp;
        if rise < STALL_RISE_F {
            info!(
                "Stall detected: meat rose {rise:.1}F over the last {STALL_WINDOW_MIN} minutes"
            );
            return true;
        }
        false
    }

    /// Flags the session for user approval. Returns false when already
    /// pending.
    pub async fn request_transition(
        &mut self,
        store: &Store,
        smoke_id: i64,
        reason: &str,
    ) -> Result<bool, ControllerError> {
        let smoke = match store.get_smoke(smoke_id).await? {
            Some(s) => s,
            None => return Ok(false),
        };

        if smoke.pending_phase_transition {
            return Ok(false);
        }

        store.set_pending_transition(smoke_id, true).await?;
        info!("Phase transition requested for smoke {smoke_id}: {reason}");
        Ok(true)
    }

    /// Executes an approved transition: ends the active phase, activates the
    /// next one, and returns it so the caller can apply its setpoint.
    /// Returns `Ok(None)` when the sequence is exhausted; the cook then
    /// continues at the last setpoint until the user ends the session.
    pub async fn approve_transition(
        &mut self,
        store: &Store,
        smoke_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<SmokePhase>, ControllerError> {
        let smoke = store
            .get_smoke(smoke_id)
            .await?
            .ok_or_else(|| ControllerError::InvalidCommand("smoke session not found".into()))?;

        if !smoke.pending_phase_transition {
            return Err(ControllerError::InvalidCommand(
                "no pending phase transition".into(),
            ));
        }

        let current = match smoke.current_phase_id {
            Some(id) => store.get_phase(id).await?,
            None => None,
        };

        let next_order = match &current {
            Some(phase) => {
                let ended_minutes = phase
                    .started_at
                    .map(|s| (now - s).num_minutes())
                    .unwrap_or(0);
                store.end_phase(phase.id, now, ended_minutes).await?;
                phase.phase_order + 1
            }
            None => 0,
        };

        let next = store.phase_by_order(smoke_id, next_order).await?;

        match next {
            Some(phase) => {
                store.activate_phase(smoke_id, phase.id, now).await?;
                self.clear_stability(smoke_id);
                info!(
                    "Phase transition: {} -> {} ({}F)",
                    current.map(|p| p.phase_name).unwrap_or_else(|| "none".into()),
                    phase.phase_name,
                    phase.target_temp_f
                );
                // Re-read so started_at/is_active reflect the update.
                Ok(store.get_phase(phase.id).await?)
            }
            None => {
                store.clear_current_phase(smoke_id).await?;
                info!("All phases complete for smoke {smoke_id}");
                Ok(None)
            }
        }
    }

    /// Force-completes the current phase: pending then immediately approved.
    pub async fn skip_phase(
        &mut self,
        store: &Store,
        smoke_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<SmokePhase>, ControllerError> {
        store.set_pending_transition(smoke_id, true).await?;
        self.approve_transition(store, smoke_id, now).await
    }

    /// Suspends condition checks; temperature control continues.
    pub async fn pause_phase(&mut self, store: &Store, smoke_id: i64) -> Result<(), ControllerError> {
        let phase = store
            .current_phase(smoke_id)
            .await?
            .ok_or_else(|| ControllerError::InvalidCommand("no active phase to pause".into()))?;

        if phase.is_paused {
            return Err(ControllerError::InvalidCommand("phase already paused".into()));
        }

        store.set_phase_paused(phase.id, true).await?;
        info!("Paused phase {} for smoke {smoke_id}", phase.phase_name);
        Ok(())
    }

    /// Resumes condition checks. The stability window restarts so a pause
    /// cannot manufacture a completed stability run.
    pub async fn resume_phase(
        &mut self,
        store: &Store,
        smoke_id: i64,
    ) -> Result<(), ControllerError> {
        let phase = store
            .current_phase(smoke_id)
            .await?
            .ok_or_else(|| ControllerError::InvalidCommand("no active phase to resume".into()))?;

        if !phase.is_paused {
            return Err(ControllerError::InvalidCommand("phase is not paused".into()));
        }

        store.set_phase_paused(phase.id, false).await?;
        self.clear_stability(smoke_id);
        info!("Resumed phase {} for smoke {smoke_id}", phase.phase_name);
        Ok(())
    }

    pub fn clear_stability(&mut self, smoke_id: i64) {
        if let Some(history) = self.stability.get_mut(&smoke_id) {
            history.clear();
        }
    }

    pub fn forget_session(&mut self, smoke_id: i64) {
        self.stability.remove(&smoke_id);
        self.meat_history.remove(&smoke_id);
    }

    /// Snapshot of the current phase for telemetry.
    pub async fn phase_snapshot(
        &self,
        store: &Store,
        smoke_id: i64,
    ) -> Result<Option<PhaseSnapshot>, ControllerError> {
        let phase = match store.current_phase(smoke_id).await? {
            Some(p) => p,
            None => return Ok(None),
        };
        Ok(Some(snapshot_of(&phase)))
    }

    /// Per-condition progress for the active phase.
    pub async fn phase_progress(
        &self,
        store: &Store,
        smoke_id: i64,
        current_temp_f: f64,
        meat_temp_f: Option<f64>,
        now: DateTime<Utc>,
    ) -> Result<Option<PhaseProgress>, ControllerError> {
        let phase = match store.current_phase(smoke_id).await? {
            Some(p) => p,
            None => return Ok(None),
        };

        let conditions = CompletionConditions::parse(&phase.completion_conditions);
        let started = phase.started_at.unwrap_or(now);
        let duration_minutes = (now - started).num_seconds() as f64 / 60.0;

        let mut factors = Vec::new();

        if let Some(max_min) = conditions.max_duration_min {
            factors.push(ConditionProgress {
                kind: "duration",
                progress: (duration_minutes / max_min * 100.0).min(100.0),
                current: duration_minutes,
                target: max_min,
                met: duration_minutes >= max_min,
            });
        }

        if let (Some(range_f), Some(duration_min)) =
            (conditions.stability_range_f, conditions.stability_duration_min)
        {
            let stable_minutes = self
                .stability
                .get(&smoke_id)
                .and_then(|h| h.front())
                .map(|(t, _)| (now - *t).num_seconds() as f64 / 60.0)
                .unwrap_or(0.0);
            let in_range = (current_temp_f - phase.target_temp_f).abs() <= range_f;

            factors.push(ConditionProgress {
                kind: "stability",
                progress: (stable_minutes / duration_min * 100.0).min(100.0),
                current: stable_minutes,
                target: duration_min,
                met: in_range && stable_minutes >= duration_min,
            });
        }

        if let Some(threshold_f) = conditions.meat_temp_threshold_f {
            let meat = meat_temp_f.unwrap_or(0.0);
            factors.push(ConditionProgress {
                kind: "meat_temp",
                progress: (meat / threshold_f * 100.0).min(100.0),
                current: meat,
                target: threshold_f,
                met: meat_temp_f.is_some_and(|m| m >= threshold_f),
            });
        }

        let overall = factors
            .iter()
            .map(|f| f.progress)
            .fold(f64::INFINITY, f64::min);

        Ok(Some(PhaseProgress {
            phase_name: phase.phase_name,
            phase_order: phase.phase_order,
            target_temp_f: phase.target_temp_f,
            duration_minutes,
            overall_progress: if overall.is_finite() { overall } else { 0.0 },
            factors,
        }))
    }
}

/// Converts a phase row into its telemetry representation.
pub fn snapshot_of(phase: &SmokePhase) -> PhaseSnapshot {
    PhaseSnapshot {
        id: phase.id,
        phase_name: phase.phase_name.clone(),
        phase_order: phase.phase_order,
        target_temp_f: phase.target_temp_f,
        started_at: phase.started_at,
        is_active: phase.is_active,
        is_paused: phase.is_paused,
        completion_conditions: serde_json::from_str(&phase.completion_conditions)
            .unwrap_or(serde_json::Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    async fn store_with_phases(conditions: &[&str]) -> (Store, i64) {
        let store = Store::open_in_memory().await.unwrap();
        let started = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();

        sqlx::query("INSERT INTO smoke (name, started_at, is_active) VALUES ('Brisket', ?, 1)")
            .bind(started)
            .execute(&store.pool)
            .await
            .unwrap();
        let smoke_id = store.active_smoke().await.unwrap().unwrap().id;

        let names = ["preheat", "load_recover", "smoke", "stall", "finish_hold"];
        for (i, cond) in conditions.iter().enumerate() {
            sqlx::query(
                r#"INSERT INTO smokephase
                   (smoke_id, phase_name, phase_order, target_temp_f, started_at, is_active,
                    is_paused, completion_conditions)
                   VALUES (?, ?, ?, ?, ?, ?, 0, ?)"#,
            )
            .bind(smoke_id)
            .bind(names[i % names.len()])
            .bind(i as i64)
            .bind(270.0 - (i as f64) * 20.0)
            .bind(if i == 0 { Some(started) } else { None })
            .bind(i == 0)
            .bind(*cond)
            .execute(&store.pool)
            .await
            .unwrap();
        }

        let first = store.phase_by_order(smoke_id, 0).await.unwrap().unwrap();
        sqlx::query("UPDATE smoke SET current_phase_id = ? WHERE id = ?")
            .bind(first.id)
            .bind(smoke_id)
            .execute(&store.pool)
            .await
            .unwrap();

        (store, smoke_id)
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_max_duration_condition() {
        let (store, smoke_id) = store_with_phases(&[r#"{"max_duration_min": 30}"#]).await;
        let mut mgr = PhaseManager::new();

        let early = mgr
            .check_conditions(&store, smoke_id, 270.0, None, t0() + Duration::minutes(29))
            .await
            .unwrap();
        assert!(early.is_none());

        let due = mgr
            .check_conditions(&store, smoke_id, 270.0, None, t0() + Duration::minutes(30))
            .await
            .unwrap();
        assert!(due.unwrap().contains("30 minutes"));
    }

    #[tokio::test]
    async fn test_stability_condition_needs_continuous_window() {
        let (store, smoke_id) =
            store_with_phases(&[r#"{"stability_range_f": 5, "stability_duration_min": 2}"#]).await;
        let mut mgr = PhaseManager::new();

        // Stable in [265, 275] for 120 s of 1 Hz samples.
        let mut fired = None;
        for i in 0..=120 {
            let now = t0() + Duration::seconds(i);
            let temp = 270.0 + if i % 2 == 0 { 3.0 } else { -3.0 };
            let result = mgr
                .check_conditions(&store, smoke_id, temp, None, now)
                .await
                .unwrap();
            if result.is_some() {
                fired = Some((i, result.unwrap()));
                break;
            }
        }

        let (at, reason) = fired.expect("stability should complete");
        assert_eq!(at, 120);
        assert!(reason.contains("stable"));
    }

    #[tokio::test]
    async fn test_stability_window_restarts_after_excursion() {
        let (store, smoke_id) =
            store_with_phases(&[r#"{"stability_range_f": 5, "stability_duration_min": 2}"#]).await;
        let mut mgr = PhaseManager::new();

        for i in 0..=120 {
            let now = t0() + Duration::seconds(i);
            // An excursion at t=60 poisons the window until it ages out.
            let temp = if i == 60 { 290.0 } else { 270.0 };
            let result = mgr
                .check_conditions(&store, smoke_id, temp, None, now)
                .await
                .unwrap();
            assert!(result.is_none(), "fired early at t={i}");
        }

        // The excursion ages out 120 s after it happened.
        for i in 121..=181 {
            let now = t0() + Duration::seconds(i);
            let result = mgr
                .check_conditions(&store, smoke_id, 270.0, None, now)
                .await
                .unwrap();
            if result.is_some() {
                assert_eq!(i, 181);
                return;
            }
        }
        panic!("stability never completed after excursion");
    }

    #[tokio::test]
    async fn test_meat_threshold_condition() {
        let (store, smoke_id) =
            store_with_phases(&[r#"{"meat_temp_threshold_f": 203}"#]).await;
        let mut mgr = PhaseManager::new();

        let not_yet = mgr
            .check_conditions(&store, smoke_id, 270.0, Some(202.5), t0())
            .await
            .unwrap();
        assert!(not_yet.is_none());

        // Without a meat probe the condition can never fire.
        let no_probe = mgr
            .check_conditions(&store, smoke_id, 270.0, None, t0())
            .await
            .unwrap();
        assert!(no_probe.is_none());

        let done = mgr
            .check_conditions(&store, smoke_id, 270.0, Some(203.0), t0())
            .await
            .unwrap();
        assert!(done.unwrap().contains("203.0"));
    }

    #[tokio::test]
    async fn test_request_and_approve_transition() {
        let (store, smoke_id) = store_with_phases(&[
            r#"{"max_duration_min": 30}"#,
            r#"{"stability_range_f": 5, "stability_duration_min": 10}"#,
        ])
        .await;
        let mut mgr = PhaseManager::new();

        assert!(mgr
            .request_transition(&store, smoke_id, "max duration")
            .await
            .unwrap());
        // A second request while pending is a no-op.
        assert!(!mgr
            .request_transition(&store, smoke_id, "again")
            .await
            .unwrap());

        let approved_at = t0() + Duration::minutes(31) + Duration::seconds(30);
        let next = mgr
            .approve_transition(&store, smoke_id, approved_at)
            .await
            .unwrap()
            .expect("second phase should activate");

        assert_eq!(next.phase_order, 1);
        assert!(next.is_active);
        assert_eq!(next.started_at, Some(approved_at));

        // The old phase closed with floor(31.5) minutes recorded.
        let old = store.phase_by_order(smoke_id, 0).await.unwrap().unwrap();
        assert!(!old.is_active);
        assert_eq!(old.ended_at, Some(approved_at));
        assert_eq!(old.actual_duration_minutes, Some(31));

        let smoke = store.get_smoke(smoke_id).await.unwrap().unwrap();
        assert_eq!(smoke.current_phase_id, Some(next.id));
        assert!(!smoke.pending_phase_transition);
    }

    #[tokio::test]
    async fn test_approve_requires_pending() {
        let (store, smoke_id) = store_with_phases(&[r#"{"max_duration_min": 30}"#]).await;
        let mut mgr = PhaseManager::new();

        let result = mgr.approve_transition(&store, smoke_id, t0()).await;
        assert!(matches!(result, Err(ControllerError::InvalidCommand(_))));
    }

    #[tokio::test]
    async fn test_last_phase_completion_clears_pointer() {
        let (store, smoke_id) = store_with_phases(&[r#"{"max_duration_min": 30}"#]).await;
        let mut mgr = PhaseManager::new();

        store.set_pending_transition(smoke_id, true).await.unwrap();
        let next = mgr
            .approve_transition(&store, smoke_id, t0() + Duration::minutes(40))
            .await
            .unwrap();
        assert!(next.is_none());

        let smoke = store.get_smoke(smoke_id).await.unwrap().unwrap();
        assert_eq!(smoke.current_phase_id, None);
        assert!(!smoke.pending_phase_transition);
        // The session itself stays active until the user ends it.
        assert!(smoke.is_active);
    }

    #[tokio::test]
    async fn test_skip_phase_moves_to_next() {
        let (store, smoke_id) = store_with_phases(&[
            r#"{"max_duration_min": 30}"#,
            r#"{"max_duration_min": 60}"#,
        ])
        .await;
        let mut mgr = PhaseManager::new();

        let next = mgr
            .skip_phase(&store, smoke_id, t0() + Duration::minutes(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.phase_order, 1);
    }

    #[tokio::test]
    async fn test_pause_suspends_resume_restarts_window() {
        let (store, smoke_id) =
            store_with_phases(&[r#"{"stability_range_f": 5, "stability_duration_min": 2}"#]).await;
        let mut mgr = PhaseManager::new();

        // Accumulate a full stable window, then pause before it is checked
        // again.
        for i in 0..=119 {
            let now = t0() + Duration::seconds(i);
            mgr.check_conditions(&store, smoke_id, 270.0, None, now)
                .await
                .unwrap();
        }

        mgr.pause_phase(&store, smoke_id).await.unwrap();
        assert!(mgr.pause_phase(&store, smoke_id).await.is_err());

        mgr.resume_phase(&store, smoke_id).await.unwrap();
        assert!(mgr.resume_phase(&store, smoke_id).await.is_err());

        // Resume cleared the window, so the timer restarts.
        let result = mgr
            .check_conditions(&store, smoke_id, 270.0, None, t0() + Duration::seconds(120))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_stall_detection() {
        let (_store, smoke_id) = store_with_phases(&[r#"{}"#]).await;
        let mut mgr = PhaseManager::new();

        // 45 minutes of meat temps rising only 1°F inside the stall band.
        let mut stalled = false;
        for i in 0..=45 {
            let now = t0() + Duration::minutes(i);
            let meat = 152.0 + (i as f64) / 45.0;
            stalled = mgr.detect_stall(smoke_id, Some(meat), now);
        }
        assert!(stalled);

        // Outside the band nothing is flagged.
        assert!(!mgr.detect_stall(smoke_id, Some(200.0), t0() + Duration::minutes(46)));
        assert!(!mgr.detect_stall(smoke_id, None, t0() + Duration::minutes(47)));
    }

    #[tokio::test]
    async fn test_stall_not_flagged_when_rising() {
        let (_store, smoke_id) = store_with_phases(&[r#"{}"#]).await;
        let mut mgr = PhaseManager::new();

        for i in 0..=45 {
            let now = t0() + Duration::minutes(i);
            // 10°F rise over the window: cooking normally.
            let meat = 150.0 + (i as f64) * 10.0 / 45.0;
            assert!(!mgr.detect_stall(smoke_id, Some(meat), now));
        }
    }

    #[tokio::test]
    async fn test_phase_progress_factors() {
        let (store, smoke_id) = store_with_phases(&[
            r#"{"max_duration_min": 30, "meat_temp_threshold_f": 200}"#,
        ])
        .await;
        let mgr = PhaseManager::new();

        let progress = mgr
            .phase_progress(
                &store,
                smoke_id,
                270.0,
                Some(100.0),
                t0() + Duration::minutes(15),
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(progress.factors.len(), 2);
        assert!((progress.factors[0].progress - 50.0).abs() < 1e-9);
        assert!((progress.factors[1].progress - 50.0).abs() < 1e-9);
        assert!((progress.overall_progress - 50.0).abs() < 1e-9);
    }
}
