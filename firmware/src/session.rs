//! Session coordination: binds the active cook to the control loop.

use tracing::{info, warn};

use crate::db::{Smoke, SmokePhase, Store};
use crate::ControllerError;

/// Tracks which cook session (if any) the loop is serving. The coordinator
/// is the only writer of `active_smoke_id`; the loop reads it every tick.
#[derive(Debug, Default)]
pub struct SessionCoordinator {
    active_smoke_id: Option<i64>,
}

impl SessionCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_smoke_id(&self) -> Option<i64> {
        self.active_smoke_id
    }

    /// Boot-time resolution of the active cook. Returns the current phase so
    /// the caller can apply its target before the first tick.
    pub async fn load_active_smoke(
        &mut self,
        store: &Store,
    ) -> Result<Option<(Smoke, Option<SmokePhase>)>, ControllerError> {
        let smoke = match store.active_smoke().await? {
            Some(s) => s,
            None => {
                info!("No active smoke session found");
                self.active_smoke_id = None;
                return Ok(None);
            }
        };

        self.active_smoke_id = Some(smoke.id);
        info!("Loaded active smoke session: {} (id={})", smoke.name, smoke.id);

        let phase = store.current_phase(smoke.id).await?;
        if let Some(p) = &phase {
            info!(
                "Session resumes in phase {} @ {:.0}F",
                p.phase_name, p.target_temp_f
            );
        }

        Ok(Some((smoke, phase)))
    }

    /// Binds a newly activated cook. Returns the phase target to apply, if
    /// the session has an active phase.
    pub async fn set_active_smoke(
        &mut self,
        store: &Store,
        smoke_id: i64,
    ) -> Result<Option<f64>, ControllerError> {
        self.active_smoke_id = Some(smoke_id);
        info!("Active smoke session set to id {smoke_id}");

        match store.current_phase(smoke_id).await? {
            Some(phase) => Ok(Some(phase.target_temp_f)),
            None => {
                warn!("No active phase found for smoke {smoke_id}; setpoint unchanged");
                Ok(None)
            }
        }
    }

    /// Ends the bound session, computing its summary statistics.
    pub async fn end_session(&mut self, store: &Store) -> Result<(), ControllerError> {
        if let Some(id) = self.active_smoke_id.take() {
            store.finish_smoke(id).await?;
            info!("Smoke session {id} ended");
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.active_smoke_id = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_load_without_active_session() {
        let store = Store::open_in_memory().await.unwrap();
        let mut coordinator = SessionCoordinator::new();

        let loaded = coordinator.load_active_smoke(&store).await.unwrap();
        assert!(loaded.is_none());
        assert_eq!(coordinator.active_smoke_id(), None);
    }

    #[tokio::test]
    async fn test_load_resolves_phase_target() {
        let store = Store::open_in_memory().await.unwrap();
        let now = Utc::now();

        sqlx::query("INSERT INTO smoke (name, started_at, is_active) VALUES ('Ribs', ?, 1)")
            .bind(now)
            .execute(&store.pool)
            .await
            .unwrap();
        let smoke = store.active_smoke().await.unwrap().unwrap();

        sqlx::query(
            r#"INSERT INTO smokephase
               (smoke_id, phase_name, phase_order, target_temp_f, started_at, is_active,
                completion_conditions)
               VALUES (?, 'preheat', 0, 270.0, ?, 1, '{}')"#,
        )
        .bind(smoke.id)
        .bind(now)
        .execute(&store.pool)
        .await
        .unwrap();
        let phase_id: (i64,) = sqlx::query_as("SELECT id FROM smokephase WHERE smoke_id = ?")
            .bind(smoke.id)
            .fetch_one(&store.pool)
            .await
            .unwrap();
        sqlx::query("UPDATE smoke SET current_phase_id = ? WHERE id = ?")
            .bind(phase_id.0)
            .bind(smoke.id)
            .execute(&store.pool)
            .await
            .unwrap();

        let mut coordinator = SessionCoordinator::new();
        let (loaded, phase) = coordinator.load_active_smoke(&store).await.unwrap().unwrap();
        assert_eq!(loaded.id, smoke.id);
        assert_eq!(phase.unwrap().target_temp_f, 270.0);
        assert_eq!(coordinator.active_smoke_id(), Some(smoke.id));

        let target = coordinator.set_active_smoke(&store, smoke.id).await.unwrap();
        assert_eq!(target, Some(270.0));
    }

    #[tokio::test]
    async fn test_end_session_clears_binding() {
        let store = Store::open_in_memory().await.unwrap();
        sqlx::query("INSERT INTO smoke (name, started_at, is_active) VALUES ('Ribs', ?, 1)")
            .bind(Utc::now())
            .execute(&store.pool)
            .await
            .unwrap();
        let smoke = store.active_smoke().await.unwrap().unwrap();

        let mut coordinator = SessionCoordinator::new();
        coordinator.set_active_smoke(&store, smoke.id).await.unwrap();
        coordinator.end_session(&store).await.unwrap();

        assert_eq!(coordinator.active_smoke_id(), None);
        assert!(store.active_smoke().await.unwrap().is_none());
    }
}
