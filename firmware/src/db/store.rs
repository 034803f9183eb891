//! Repository layer over the single-file SQLite store.
//!
//! Every operation is short-scoped: acquire, commit, release. The control
//! loop treats persistence failures as soft errors; nothing here is allowed
//! to take the loop down.

use std::path::Path;

use chrono::{DateTime, Utc};
use config_types::EnvConfig;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::info;

use super::models::{
    Alert, Event, NewReading, NewThermocoupleReading, SettingsRow, Smoke, SmokePhase, Thermocouple,
};
use crate::ControllerError;

/// Handle to the local store. Cheap to clone; all methods are `&self`.
#[derive(Clone)]
pub struct Store {
    pub(crate) pool: SqlitePool,
}

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS settings (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        units TEXT NOT NULL DEFAULT 'F',
        setpoint_c REAL NOT NULL,
        setpoint_f REAL NOT NULL,
        control_mode TEXT NOT NULL DEFAULT 'thermostat',
        kp REAL NOT NULL,
        ki REAL NOT NULL,
        kd REAL NOT NULL,
        min_on_s INTEGER NOT NULL,
        min_off_s INTEGER NOT NULL,
        hyst_c REAL NOT NULL,
        time_window_s INTEGER NOT NULL,
        hi_alarm_c REAL NOT NULL,
        lo_alarm_c REAL NOT NULL,
        stuck_high_rate_c_per_min REAL NOT NULL,
        stuck_high_duration_s INTEGER NOT NULL,
        sim_mode INTEGER NOT NULL DEFAULT 0,
        gpio_pin INTEGER NOT NULL,
        relay_active_high INTEGER NOT NULL DEFAULT 0,
        boost_duration_s INTEGER NOT NULL,
        adaptive_pid_enabled INTEGER NOT NULL DEFAULT 1,
        webhook_url TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS thermocouple (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        cs_pin INTEGER NOT NULL,
        enabled INTEGER NOT NULL DEFAULT 1,
        is_control INTEGER NOT NULL DEFAULT 0,
        "order" INTEGER NOT NULL DEFAULT 0,
        color TEXT NOT NULL DEFAULT '#3b82f6',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS cookingrecipe (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        description TEXT,
        phases TEXT NOT NULL,
        is_system INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS smoke (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        description TEXT,
        started_at TEXT NOT NULL,
        ended_at TEXT,
        is_active INTEGER NOT NULL DEFAULT 1,
        recipe_id INTEGER REFERENCES cookingrecipe(id),
        recipe_config TEXT,
        current_phase_id INTEGER,
        meat_target_temp_f REAL,
        meat_probe_tc_id INTEGER REFERENCES thermocouple(id),
        pending_phase_transition INTEGER NOT NULL DEFAULT 0,
        total_duration_minutes INTEGER,
        avg_temp_f REAL,
        min_temp_f REAL,
        max_temp_f REAL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS smokephase (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        smoke_id INTEGER NOT NULL REFERENCES smoke(id),
        phase_name TEXT NOT NULL,
        phase_order INTEGER NOT NULL,
        target_temp_f REAL NOT NULL,
        started_at TEXT,
        ended_at TEXT,
        is_active INTEGER NOT NULL DEFAULT 0,
        is_paused INTEGER NOT NULL DEFAULT 0,
        completion_conditions TEXT NOT NULL,
        actual_duration_minutes INTEGER
    )"#,
    r#"CREATE TABLE IF NOT EXISTS reading (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ts TEXT NOT NULL,
        smoke_id INTEGER REFERENCES smoke(id),
        temp_c REAL NOT NULL,
        temp_f REAL NOT NULL,
        setpoint_c REAL NOT NULL,
        setpoint_f REAL NOT NULL,
        output_bool INTEGER NOT NULL,
        relay_state INTEGER NOT NULL,
        loop_ms INTEGER NOT NULL,
        pid_output REAL NOT NULL,
        boost_active INTEGER NOT NULL DEFAULT 0
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_reading_ts ON reading(ts)"#,
    r#"CREATE INDEX IF NOT EXISTS idx_reading_smoke_ts ON reading(smoke_id, ts)"#,
    r#"CREATE TABLE IF NOT EXISTS thermocouplereading (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        reading_id INTEGER NOT NULL REFERENCES reading(id),
        thermocouple_id INTEGER NOT NULL REFERENCES thermocouple(id),
        temp_c REAL NOT NULL,
        temp_f REAL NOT NULL,
        fault INTEGER NOT NULL DEFAULT 0
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_tcreading_reading ON thermocouplereading(reading_id)"#,
    r#"CREATE TABLE IF NOT EXISTS alert (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ts TEXT NOT NULL,
        alert_type TEXT NOT NULL,
        severity TEXT NOT NULL,
        message TEXT NOT NULL,
        active INTEGER NOT NULL DEFAULT 1,
        acknowledged INTEGER NOT NULL DEFAULT 0,
        cleared_ts TEXT,
        meta_data TEXT
    )"#,
    r#"CREATE TABLE IF NOT EXISTS event (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ts TEXT NOT NULL,
        kind TEXT NOT NULL,
        message TEXT NOT NULL,
        meta_json TEXT
    )"#,
];

impl Store {
    /// Opens (creating if missing) the store at `path` and applies the
    /// schema.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, ControllerError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        info!("Store opened at {}", path.as_ref().display());
        Ok(store)
    }

    /// In-memory store for tests.
    pub async fn open_in_memory() -> Result<Self, ControllerError> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .foreign_keys(true);

        // One connection: every handle must see the same memory database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), ControllerError> {
        for ddl in SCHEMA {
            sqlx::query(ddl).execute(&self.pool).await?;
        }
        Ok(())
    }

    // Settings

    /// Returns the settings row, creating it from environment defaults when
    /// `seed` is provided and no row exists yet.
    pub async fn ensure_settings(
        &self,
        seed: &EnvConfig,
    ) -> Result<SettingsRow, ControllerError> {
        if let Some(row) = self.get_settings().await? {
            return Ok(row);
        }

        let now = Utc::now();
        sqlx::query(
            r#"INSERT INTO settings (
                id, units, setpoint_c, setpoint_f, control_mode,
                kp, ki, kd, min_on_s, min_off_s, hyst_c, time_window_s,
                hi_alarm_c, lo_alarm_c, stuck_high_rate_c_per_min,
                stuck_high_duration_s, sim_mode, gpio_pin, relay_active_high,
                boost_duration_s, adaptive_pid_enabled, webhook_url,
                created_at, updated_at
            ) VALUES (1, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(seed.units.as_str())
        .bind(seed.setpoint_celsius())
        .bind(seed.setpoint_fahrenheit())
        .bind(seed.control_mode.as_str())
        .bind(seed.pid_kp)
        .bind(seed.pid_ki)
        .bind(seed.pid_kd)
        .bind(seed.min_on_s)
        .bind(seed.min_off_s)
        .bind(seed.hyst_c)
        .bind(seed.time_window_s)
        .bind(seed.hi_alarm_c)
        .bind(seed.lo_alarm_c)
        .bind(seed.stuck_high_rate_c_per_min)
        .bind(seed.stuck_high_duration_s)
        .bind(seed.sim_mode)
        .bind(seed.gpio_pin as i64)
        .bind(seed.relay_active_high)
        .bind(seed.boost_duration_s)
        .bind(true)
        .bind(seed.webhook_url.as_deref())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        info!("Seeded settings row from environment defaults");

        self.get_settings()
            .await?
            .ok_or_else(|| ControllerError::Store(sqlx::Error::RowNotFound))
    }

    pub async fn get_settings(&self) -> Result<Option<SettingsRow>, ControllerError> {
        let row = sqlx::query_as::<_, SettingsRow>("SELECT * FROM settings WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Persists new PID gains (auto-tune apply, adaptive adjustments).
    pub async fn save_pid_gains(&self, kp: f64, ki: f64, kd: f64) -> Result<(), ControllerError> {
        sqlx::query("UPDATE settings SET kp = ?, ki = ?, kd = ?, updated_at = ? WHERE id = 1")
            .bind(kp)
            .bind(ki)
            .bind(kd)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn save_setpoint(
        &self,
        setpoint_c: f64,
        setpoint_f: f64,
    ) -> Result<(), ControllerError> {
        sqlx::query(
            "UPDATE settings SET setpoint_c = ?, setpoint_f = ?, updated_at = ? WHERE id = 1",
        )
        .bind(setpoint_c)
        .bind(setpoint_f)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn save_adaptive_enabled(&self, enabled: bool) -> Result<(), ControllerError> {
        sqlx::query("UPDATE settings SET adaptive_pid_enabled = ?, updated_at = ? WHERE id = 1")
            .bind(enabled)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn save_control_mode(&self, mode: &str) -> Result<(), ControllerError> {
        sqlx::query("UPDATE settings SET control_mode = ?, updated_at = ? WHERE id = 1")
            .bind(mode)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // Readings

    /// Appends a control-loop reading plus its per-channel rows in one
    /// transaction: both commit or neither.
    pub async fn append_reading(
        &self,
        reading: &NewReading,
        channels: &[NewThermocoupleReading],
    ) -> Result<i64, ControllerError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"INSERT INTO reading (
                ts, smoke_id, temp_c, temp_f, setpoint_c, setpoint_f,
                output_bool, relay_state, loop_ms, pid_output, boost_active
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(reading.ts)
        .bind(reading.smoke_id)
        .bind(reading.temp_c)
        .bind(reading.temp_f)
        .bind(reading.setpoint_c)
        .bind(reading.setpoint_f)
        .bind(reading.output_bool)
        .bind(reading.relay_state)
        .bind(reading.loop_ms)
        .bind(reading.pid_output)
        .bind(reading.boost_active)
        .execute(&mut *tx)
        .await?;

        let reading_id = result.last_insert_rowid();

        for tc in channels {
            sqlx::query(
                r#"INSERT INTO thermocouplereading (
                    reading_id, thermocouple_id, temp_c, temp_f, fault
                ) VALUES (?, ?, ?, ?, ?)"#,
            )
            .bind(reading_id)
            .bind(tc.thermocouple_id)
            .bind(tc.temp_c)
            .bind(tc.temp_f)
            .bind(tc.fault)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(reading_id)
    }

    // Events

    pub async fn log_event(
        &self,
        kind: &str,
        message: &str,
        meta: Option<&serde_json::Value>,
    ) -> Result<(), ControllerError> {
        sqlx::query("INSERT INTO event (ts, kind, message, meta_json) VALUES (?, ?, ?, ?)")
            .bind(Utc::now())
            .bind(kind)
            .bind(message)
            .bind(meta.map(|m| m.to_string()))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn recent_events(&self, limit: i64) -> Result<Vec<Event>, ControllerError> {
        let rows = sqlx::query_as::<_, Event>("SELECT * FROM event ORDER BY ts DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    // Alerts

    pub async fn insert_alert(
        &self,
        ts: DateTime<Utc>,
        alert_type: &str,
        severity: &str,
        message: &str,
        meta_data: Option<&serde_json::Value>,
    ) -> Result<i64, ControllerError> {
        let result = sqlx::query(
            r#"INSERT INTO alert (ts, alert_type, severity, message, active, acknowledged, meta_data)
               VALUES (?, ?, ?, ?, 1, 0, ?)"#,
        )
        .bind(ts)
        .bind(alert_type)
        .bind(severity)
        .bind(message)
        .bind(meta_data.map(|m| m.to_string()))
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get_alert(&self, id: i64) -> Result<Option<Alert>, ControllerError> {
        let row = sqlx::query_as::<_, Alert>("SELECT * FROM alert WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn clear_alert(&self, id: i64, cleared_ts: DateTime<Utc>) -> Result<(), ControllerError> {
        sqlx::query("UPDATE alert SET active = 0, cleared_ts = ? WHERE id = ?")
            .bind(cleared_ts)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn acknowledge_alert(&self, id: i64) -> Result<bool, ControllerError> {
        let result = sqlx::query("UPDATE alert SET acknowledged = 1 WHERE id = ? AND active = 1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn active_alerts(&self) -> Result<Vec<Alert>, ControllerError> {
        let rows = sqlx::query_as::<_, Alert>("SELECT * FROM alert WHERE active = 1 ORDER BY ts")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    // Thermocouples

    pub async fn enabled_thermocouples(&self) -> Result<Vec<Thermocouple>, ControllerError> {
        let rows = sqlx::query_as::<_, Thermocouple>(
            r#"SELECT * FROM thermocouple WHERE enabled = 1 ORDER BY "order""#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn insert_thermocouple(
        &self,
        name: &str,
        cs_pin: i64,
        is_control: bool,
        display_order: i64,
        color: &str,
    ) -> Result<i64, ControllerError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"INSERT INTO thermocouple (name, cs_pin, enabled, is_control, "order", color, created_at, updated_at)
               VALUES (?, ?, 1, ?, ?, ?, ?, ?)"#,
        )
        .bind(name)
        .bind(cs_pin)
        .bind(is_control)
        .bind(display_order)
        .bind(color)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    // Smokes and phases

    pub async fn active_smoke(&self) -> Result<Option<Smoke>, ControllerError> {
        let row = sqlx::query_as::<_, Smoke>("SELECT * FROM smoke WHERE is_active = 1 LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn get_smoke(&self, id: i64) -> Result<Option<Smoke>, ControllerError> {
        let row = sqlx::query_as::<_, Smoke>("SELECT * FROM smoke WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn get_phase(&self, id: i64) -> Result<Option<SmokePhase>, ControllerError> {
        let row = sqlx::query_as::<_, SmokePhase>("SELECT * FROM smokephase WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// The phase a smoke currently points at, if any.
    pub async fn current_phase(&self, smoke_id: i64) -> Result<Option<SmokePhase>, ControllerError> {
        let smoke = match self.get_smoke(smoke_id).await? {
            Some(s) => s,
            None => return Ok(None),
        };
        match smoke.current_phase_id {
            Some(phase_id) => self.get_phase(phase_id).await,
            None => Ok(None),
        }
    }

    pub async fn phase_by_order(
        &self,
        smoke_id: i64,
        phase_order: i64,
    ) -> Result<Option<SmokePhase>, ControllerError> {
        let row = sqlx::query_as::<_, SmokePhase>(
            "SELECT * FROM smokephase WHERE smoke_id = ? AND phase_order = ?",
        )
        .bind(smoke_id)
        .bind(phase_order)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn set_pending_transition(
        &self,
        smoke_id: i64,
        pending: bool,
    ) -> Result<(), ControllerError> {
        sqlx::query("UPDATE smoke SET pending_phase_transition = ? WHERE id = ?")
            .bind(pending)
            .bind(smoke_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Closes out a phase: deactivates it and records its wall-clock length.
    pub async fn end_phase(
        &self,
        phase_id: i64,
        ended_at: DateTime<Utc>,
        actual_duration_minutes: i64,
    ) -> Result<(), ControllerError> {
        sqlx::query(
            "UPDATE smokephase SET is_active = 0, ended_at = ?, actual_duration_minutes = ? WHERE id = ?",
        )
        .bind(ended_at)
        .bind(actual_duration_minutes)
        .bind(phase_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Activates a phase and points the smoke at it, clearing the pending
    /// flag, all in one transaction.
    pub async fn activate_phase(
        &self,
        smoke_id: i64,
        phase_id: i64,
        started_at: DateTime<Utc>,
    ) -> Result<(), ControllerError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE smokephase SET is_active = 1, started_at = ? WHERE id = ?")
            .bind(started_at)
            .bind(phase_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE smoke SET current_phase_id = ?, pending_phase_transition = 0 WHERE id = ?",
        )
        .bind(phase_id)
        .bind(smoke_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Clears the current phase pointer after the last phase completes. The
    /// cook continues at the last setpoint until the user ends the session.
    pub async fn clear_current_phase(&self, smoke_id: i64) -> Result<(), ControllerError> {
        sqlx::query(
            "UPDATE smoke SET current_phase_id = NULL, pending_phase_transition = 0 WHERE id = ?",
        )
        .bind(smoke_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_phase_paused(&self, phase_id: i64, paused: bool) -> Result<(), ControllerError> {
        sqlx::query("UPDATE smokephase SET is_paused = ? WHERE id = ?")
            .bind(paused)
            .bind(phase_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_phase_target(
        &self,
        phase_id: i64,
        target_temp_f: f64,
    ) -> Result<(), ControllerError> {
        sqlx::query("UPDATE smokephase SET target_temp_f = ? WHERE id = ?")
            .bind(target_temp_f)
            .bind(phase_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Ends a cook: clears `is_active`, stamps `ended_at`, and computes the
    /// session summary statistics from its readings.
    pub async fn finish_smoke(&self, smoke_id: i64) -> Result<(), ControllerError> {
        let smoke = match self.get_smoke(smoke_id).await? {
            Some(s) => s,
            None => return Ok(()),
        };

        let ended_at = Utc::now();
        let total_minutes = (ended_at - smoke.started_at).num_minutes();

        let stats: (Option<f64>, Option<f64>, Option<f64>) = sqlx::query_as(
            "SELECT AVG(temp_f), MIN(temp_f), MAX(temp_f) FROM reading WHERE smoke_id = ?",
        )
        .bind(smoke_id)
        .fetch_one(&self.pool)
        .await?;

        sqlx::query(
            r#"UPDATE smoke SET is_active = 0, ended_at = ?, total_duration_minutes = ?,
               avg_temp_f = ?, min_temp_f = ?, max_temp_f = ? WHERE id = ?"#,
        )
        .bind(ended_at)
        .bind(total_minutes)
        .bind(stats.0)
        .bind(stats.1)
        .bind(stats.2)
        .bind(smoke_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
