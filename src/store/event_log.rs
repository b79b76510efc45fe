//! Append-only event log.
//!
//! `append` validates the envelope and lets SQLite stamp `ingested_at`; the
//! stamped value is read back with RETURNING so the committed event is what
//! callers fold. `fetch_since` pages by a strict exclusive
//! `(ingested_at, event_id)` watermark.

use crate::domain::event::{AggregateKind, Event, NewEvent, Watermark};
use crate::domain::ids::{ActorId, ActorKind, CorrelationId, CycleId, EventId};
use crate::errors::{CoreError, CoreResult};
use chrono::DateTime;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

/// Append one validated event. The caller's transaction owns atomicity; a
/// duplicate event id surfaces as a primary-key failure.
pub fn append(conn: &Connection, new_event: &NewEvent) -> CoreResult<Event> {
    new_event.validate()?;
    let data_json = serde_json::to_string(&new_event.event_data)?;
    let ingested_at_ms: i64 = conn.query_row(
        "INSERT INTO events (event_id, aggregate_kind, aggregate_id, event_type, event_data,
                             occurred_at, cycle_id, correlation_id, causation_id,
                             actor_id, actor_kind)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         RETURNING ingested_at",
        params![
            new_event.event_id.to_string(),
            new_event.aggregate_kind.as_str(),
            new_event.aggregate_id,
            new_event.event_type,
            data_json,
            new_event.occurred_at.to_rfc3339(),
            new_event.cycle_id.as_str(),
            new_event.correlation_id.as_str(),
            new_event.causation_id.map(|id| id.to_string()),
            new_event.actor_id.as_str(),
            new_event.actor_kind.as_str(),
        ],
        |row| row.get(0),
    )?;
    debug!(
        event_type = %new_event.event_type,
        aggregate_id = %new_event.aggregate_id,
        "appended event {}",
        new_event.event_id
    );
    Ok(Event {
        event_id: new_event.event_id,
        aggregate_kind: new_event.aggregate_kind,
        aggregate_id: new_event.aggregate_id.clone(),
        event_type: new_event.event_type.clone(),
        event_data: new_event.event_data.clone(),
        occurred_at: new_event.occurred_at,
        ingested_at_ms,
        cycle_id: new_event.cycle_id.clone(),
        correlation_id: new_event.correlation_id.clone(),
        causation_id: new_event.causation_id,
        actor_id: new_event.actor_id.clone(),
        actor_kind: new_event.actor_kind,
    })
}

const EVENT_COLUMNS: &str = "event_id, aggregate_kind, aggregate_id, event_type, event_data,
     occurred_at, ingested_at, cycle_id, correlation_id, causation_id, actor_id, actor_kind";

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<Event> {
    let event_id: String = row.get(0)?;
    let aggregate_kind: String = row.get(1)?;
    let event_data: String = row.get(4)?;
    let occurred_at: String = row.get(5)?;
    let causation_id: Option<String> = row.get(9)?;
    let actor_kind: String = row.get(11)?;
    let invalid = |msg: &str| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            msg.to_string().into(),
        )
    };
    Ok(Event {
        event_id: EventId::parse(&event_id).ok_or_else(|| invalid("bad event_id"))?,
        aggregate_kind: AggregateKind::parse(&aggregate_kind)
            .ok_or_else(|| invalid("bad aggregate_kind"))?,
        aggregate_id: row.get(2)?,
        event_type: row.get(3)?,
        event_data: serde_json::from_str(&event_data)
            .map_err(|e| invalid(&format!("bad event_data: {}", e)))?,
        occurred_at: DateTime::parse_from_rfc3339(&occurred_at)
            .map_err(|e| invalid(&format!("bad occurred_at: {}", e)))?
            .into(),
        ingested_at_ms: row.get(6)?,
        cycle_id: CycleId::new(row.get::<_, String>(7)?),
        correlation_id: CorrelationId::new(row.get::<_, String>(8)?),
        causation_id: causation_id.as_deref().and_then(EventId::parse),
        actor_id: ActorId::new(row.get::<_, String>(10)?),
        actor_kind: ActorKind::parse(&actor_kind).ok_or_else(|| invalid("bad actor_kind"))?,
    })
}

/// Events strictly after the watermark, ascending in tuple order, at most
/// `limit` rows. The zero watermark reads from the beginning.
pub fn fetch_since(conn: &Connection, watermark: Watermark, limit: u32) -> CoreResult<Vec<Event>> {
    let sql = format!(
        "SELECT {EVENT_COLUMNS} FROM events
         WHERE ingested_at > ?1 OR (ingested_at = ?1 AND event_id > ?2)
         ORDER BY ingested_at ASC, event_id ASC
         LIMIT ?3"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(
        params![watermark.ingested_at_ms, watermark.event_id.to_string(), limit],
        row_to_event,
    )?;
    let mut events = Vec::new();
    for row in rows {
        events.push(row?);
    }
    Ok(events)
}

/// All events for one aggregate in replay order.
pub fn fetch_aggregate(
    conn: &Connection,
    kind: AggregateKind,
    aggregate_id: &str,
) -> CoreResult<Vec<Event>> {
    let sql = format!(
        "SELECT {EVENT_COLUMNS} FROM events
         WHERE aggregate_kind = ?1 AND aggregate_id = ?2
         ORDER BY ingested_at ASC, event_id ASC"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(params![kind.as_str(), aggregate_id], row_to_event)?;
    let mut events = Vec::new();
    for row in rows {
        events.push(row?);
    }
    Ok(events)
}

/// Whether a `GRANT_CYCLE_CLOSED` event exists for the cycle.
pub fn cycle_is_closed(conn: &Connection, cycle_id: &CycleId) -> CoreResult<bool> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM events WHERE cycle_id = ?1 AND event_type = 'GRANT_CYCLE_CLOSED'",
        params![cycle_id.as_str()],
        |row| row.get(0),
    )?;
    Ok(n > 0)
}

/// Does any event exist for the cycle with the given type?
pub fn cycle_has_event(conn: &Connection, cycle_id: &CycleId, event_type: &str) -> CoreResult<bool> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM events WHERE cycle_id = ?1 AND event_type = ?2",
        params![cycle_id.as_str(), event_type],
        |row| row.get(0),
    )?;
    Ok(n > 0)
}

/// The current tail of the log, if any.
pub fn latest_watermark(conn: &Connection) -> CoreResult<Watermark> {
    let row: Option<(i64, String)> = conn
        .query_row(
            "SELECT ingested_at, event_id FROM events
             ORDER BY ingested_at DESC, event_id DESC LIMIT 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    Ok(match row {
        Some((ingested_at_ms, id)) => Watermark {
            ingested_at_ms,
            event_id: EventId::parse(&id)
                .ok_or(CoreError::UuidTimeOrderedRequired { event_id: id })?,
        },
        None => Watermark::zero(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::event::{CLAIM_SUBMITTED, GRANT_AWARDED};
    use crate::domain::ids::EventIdGen;
    use crate::store::db::Db;
    use chrono::Utc;
    use serde_json::json;

    fn make_event(gen: &EventIdGen, event_type: &str, aggregate_id: &str) -> NewEvent {
        NewEvent {
            event_id: gen.next_now(),
            aggregate_kind: AggregateKind::Grant,
            aggregate_id: aggregate_id.to_string(),
            event_type: event_type.to_string(),
            event_data: json!({ "amountCents": "1000" }),
            occurred_at: Utc::now(),
            cycle_id: CycleId::new("FY2026"),
            correlation_id: CorrelationId::new("corr-1"),
            causation_id: None,
            actor_id: ActorId::new("tester"),
            actor_kind: ActorKind::System,
        }
    }

    #[test]
    fn append_stamps_ingest_time_server_side() {
        let db = Db::in_memory().unwrap();
        let gen = EventIdGen::new();
        let before = Utc::now().timestamp_millis();
        let event = db.with_tx(|tx| append(tx, &make_event(&gen, GRANT_AWARDED, "g1"))).unwrap();
        let after = Utc::now().timestamp_millis();
        assert!(
            event.ingested_at_ms >= before - 5 && event.ingested_at_ms <= after + 5,
            "ingested_at {} outside call window [{}, {}]",
            event.ingested_at_ms,
            before,
            after
        );
    }

    #[test]
    fn update_and_delete_rejected_by_trigger() {
        let db = Db::in_memory().unwrap();
        let gen = EventIdGen::new();
        db.with_tx(|tx| append(tx, &make_event(&gen, GRANT_AWARDED, "g1"))).unwrap();

        let update = db.with_tx(|tx| {
            tx.execute("UPDATE events SET event_type = 'HACKED'", [])
                .map_err(CoreError::from)?;
            Ok(())
        });
        assert!(matches!(update, Err(CoreError::ImmutabilityViolation)));

        let delete = db.with_tx(|tx| {
            tx.execute("DELETE FROM events", []).map_err(CoreError::from)?;
            Ok(())
        });
        assert!(matches!(delete, Err(CoreError::ImmutabilityViolation)));
    }

    #[test]
    fn duplicate_event_id_collides() {
        let db = Db::in_memory().unwrap();
        let gen = EventIdGen::new();
        let ev = make_event(&gen, GRANT_AWARDED, "g1");
        db.with_tx(|tx| append(tx, &ev)).unwrap();
        let dup = db.with_tx(|tx| append(tx, &ev));
        assert!(dup.is_err());
    }

    #[test]
    fn fetch_since_pages_every_event_exactly_once_with_limit_one() {
        let db = Db::in_memory().unwrap();
        let gen = EventIdGen::new();
        let mut appended = Vec::new();
        for i in 0..7 {
            let ev = db
                .with_tx(|tx| append(tx, &make_event(&gen, CLAIM_SUBMITTED, &format!("c{}", i))))
                .unwrap();
            appended.push(ev.event_id);
        }

        let mut seen = Vec::new();
        let mut watermark = Watermark::zero();
        loop {
            let page = db.with_conn(|conn| fetch_since(conn, watermark, 1)).unwrap();
            match page.as_slice() {
                [] => break,
                [event] => {
                    seen.push(event.event_id);
                    watermark = event.watermark();
                }
                _ => panic!("limit 1 returned more than one row"),
            }
        }
        assert_eq!(seen, appended);

        // Paging from the last event's own watermark re-emits nothing.
        let tail = db.with_conn(|conn| fetch_since(conn, watermark, 100)).unwrap();
        assert!(tail.is_empty());
    }

    #[test]
    fn fetch_since_orders_strictly_ascending() {
        let db = Db::in_memory().unwrap();
        let gen = EventIdGen::new();
        for i in 0..20 {
            db.with_tx(|tx| append(tx, &make_event(&gen, GRANT_AWARDED, &format!("g{}", i))))
                .unwrap();
        }
        let all = db.with_conn(|conn| fetch_since(conn, Watermark::zero(), 1000)).unwrap();
        assert_eq!(all.len(), 20);
        for pair in all.windows(2) {
            assert!(pair[0].watermark() < pair[1].watermark());
        }
    }
}
