//! # Membership Repository
//!
//! Persists the confirmation state machine: one row per zone holding the
//! confirmed-inside flag, both open candidates, and the bookkeeping used by
//! the stale sweep and forced exits.
//!
//! ## Row Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  first fix touching a zone ──► row UPSERTed (candidate opened)         │
//! │  every changed fix         ──► row UPSERTed (count, flag, position)    │
//! │  track becomes idle        ──► row DELETEd (outside, no candidates)    │
//! │                                                                         │
//! │  Flag, counters and first-observed instants live in the same row, so   │
//! │  a crash can never leave a count without its start time.               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;

use waypost_core::confirmation::{Candidate, PresenceState, ZoneTrack};
use waypost_core::geo::Position;

use super::{from_millis, to_millis};
use crate::error::DbResult;

#[derive(Debug, sqlx::FromRow)]
struct MembershipRow {
    zone_code: String,
    inside: bool,
    entering_first_ms: Option<i64>,
    entering_count: i64,
    exiting_first_ms: Option<i64>,
    exiting_count: i64,
    last_event_ms: Option<i64>,
    last_latitude: Option<f64>,
    last_longitude: Option<f64>,
}

fn candidate(first_ms: Option<i64>, count: i64) -> Option<Candidate> {
    from_millis(first_ms).map(|first_observed_at| Candidate {
        first_observed_at,
        count: u32::try_from(count).unwrap_or(0),
    })
}

impl MembershipRow {
    fn into_track(self) -> (String, ZoneTrack) {
        let last_position = match (self.last_latitude, self.last_longitude) {
            (Some(lat), Some(lng)) => Some(Position::new(lat, lng)),
            _ => None,
        };
        let track = ZoneTrack {
            inside: self.inside,
            entering: candidate(self.entering_first_ms, self.entering_count),
            exiting: candidate(self.exiting_first_ms, self.exiting_count),
            last_event_at: from_millis(self.last_event_ms),
            last_position,
        };
        (self.zone_code, track)
    }
}

/// Writes one zone's track, deleting the row when there is nothing left to
/// remember.
pub(crate) async fn write_track(
    conn: &mut SqliteConnection,
    zone_code: &str,
    track: Option<&ZoneTrack>,
) -> DbResult<()> {
    let track = match track {
        Some(t) if !t.is_idle() => t,
        _ => {
            sqlx::query("DELETE FROM zone_membership WHERE zone_code = ?1")
                .bind(zone_code)
                .execute(&mut *conn)
                .await?;
            return Ok(());
        }
    };

    sqlx::query(
        r#"
        INSERT INTO zone_membership (
            zone_code, inside,
            entering_first_ms, entering_count,
            exiting_first_ms, exiting_count,
            last_event_ms, last_latitude, last_longitude, updated_ms
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        ON CONFLICT (zone_code) DO UPDATE SET
            inside            = excluded.inside,
            entering_first_ms = excluded.entering_first_ms,
            entering_count    = excluded.entering_count,
            exiting_first_ms  = excluded.exiting_first_ms,
            exiting_count     = excluded.exiting_count,
            last_event_ms     = excluded.last_event_ms,
            last_latitude     = excluded.last_latitude,
            last_longitude    = excluded.last_longitude,
            updated_ms        = excluded.updated_ms
        "#,
    )
    .bind(zone_code)
    .bind(track.inside)
    .bind(track.entering.map(|c| to_millis(c.first_observed_at)))
    .bind(track.entering.map_or(0, |c| i64::from(c.count)))
    .bind(track.exiting.map(|c| to_millis(c.first_observed_at)))
    .bind(track.exiting.map_or(0, |c| i64::from(c.count)))
    .bind(track.last_event_at.map(to_millis))
    .bind(track.last_position.map(|p| p.latitude))
    .bind(track.last_position.map(|p| p.longitude))
    .bind(to_millis(Utc::now()))
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Repository for per-zone membership state.
#[derive(Debug, Clone)]
pub struct MembershipRepository {
    pool: SqlitePool,
}

impl MembershipRepository {
    pub fn new(pool: SqlitePool) -> Self {
        MembershipRepository { pool }
    }

    /// Rebuilds the state machine from disk.
    pub async fn load_state(&self) -> DbResult<PresenceState> {
        let rows = sqlx::query_as::<_, MembershipRow>(
            r#"
            SELECT zone_code, inside,
                   entering_first_ms, entering_count,
                   exiting_first_ms, exiting_count,
                   last_event_ms, last_latitude, last_longitude
            FROM zone_membership
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let tracks: BTreeMap<String, ZoneTrack> =
            rows.into_iter().map(MembershipRow::into_track).collect();
        Ok(PresenceState::from_tracks(tracks))
    }

    /// Persists the tracks of `changed` zones in one transaction.
    pub async fn save_changes(&self, state: &PresenceState, changed: &BTreeSet<String>) -> DbResult<()> {
        if changed.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for code in changed {
            write_track(&mut tx, code, state.track(code)).await?;
        }
        tx.commit().await?;

        debug!(zones = changed.len(), "Membership persisted");
        Ok(())
    }

    /// Codes of zones persisted as inside.
    pub async fn inside_zones(&self) -> DbResult<Vec<String>> {
        let codes = sqlx::query_scalar::<_, String>(
            "SELECT zone_code FROM zone_membership WHERE inside = 1 ORDER BY zone_code",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(codes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};
    use chrono::{DateTime, Duration};
    use waypost_core::confirmation::ConfirmationPolicy;
    use waypost_core::geo::{offset_north, Fix};
    use waypost_core::zone::Zone;

    fn zone() -> Zone {
        Zone::new("A", "Site A", 10.0, 20.0, 100.0).unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[tokio::test]
    async fn test_candidate_state_survives_restart() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let z = zone();
        let zones = vec![z.clone()];
        let policy = ConfirmationPolicy::default();

        let mut state = PresenceState::default();
        let out = state.step(&Fix::new(z.center(), 5.0, at(0)), &zones, &policy);
        db.membership().save_changes(&state, &out.changed).await.unwrap();
        let out = state.step(&Fix::new(z.center(), 5.0, at(60)), &zones, &policy);
        db.membership().save_changes(&state, &out.changed).await.unwrap();

        // "Process restart": rebuild and finish the confirmation
        let mut restored = db.membership().load_state().await.unwrap();
        assert_eq!(restored, state);
        let out = restored.step(&Fix::new(z.center(), 5.0, at(120)), &zones, &policy);
        assert_eq!(out.transitions.len(), 1);
        db.membership().save_changes(&restored, &out.changed).await.unwrap();

        assert_eq!(db.membership().inside_zones().await.unwrap(), vec!["A".to_string()]);
        let track = db.membership().load_state().await.unwrap();
        assert_eq!(track.track("A").unwrap().last_event_at, Some(at(120)));
        assert!(track.track("A").unwrap().last_position.is_some());
    }

    #[tokio::test]
    async fn test_idle_track_row_is_deleted() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let z = zone();
        let zones = vec![z.clone()];
        let policy = ConfirmationPolicy::default();

        let mut state = PresenceState::default();
        let out = state.step(&Fix::new(z.center(), 5.0, at(0)), &zones, &policy);
        db.membership().save_changes(&state, &out.changed).await.unwrap();
        assert_eq!(db.membership().load_state().await.unwrap().tracks().len(), 1);

        state.clear_counters("A");
        let changed = BTreeSet::from(["A".to_string()]);
        db.membership().save_changes(&state, &changed).await.unwrap();
        assert!(db.membership().load_state().await.unwrap().tracks().is_empty());

        // Far away fix never creates a row
        let far = Fix::new(offset_north(&z.center(), 5_000.0), 5.0, at(10) + Duration::seconds(1));
        let out = state.step(&far, &zones, &policy);
        db.membership().save_changes(&state, &out.changed).await.unwrap();
        assert!(db.membership().load_state().await.unwrap().tracks().is_empty());
    }
}
