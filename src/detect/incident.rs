//! Anomaly store: append-only anomaly events and the incidents that link
//! them. Events are never deleted; only `resolved_ms` and
//! `cascade_incident_id` are patched.

use crate::detect::{AnomalyEvent, CascadeIncident, ChainLink, DetectError, Severity};
use crate::metrics::Component;
use crate::storage::{from_millis, parse_column, to_millis, Pool};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, OptionalExtension};
use uuid::Uuid;

const EVENT_COLUMNS: &str = "id, ts_ms, component, metric_name, host, value, severity, threshold, \
     reason, duration_ms, resolved_ms, cascade_incident_id, tags_json";

/// Selection over anomaly events. Results are newest first.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub from: Option<DateTime<Utc>>,
    /// Also admit events older than `from` that were stored at or after
    /// this instant (late deliveries).
    pub created_from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub component: Option<Component>,
    pub severity: Option<Severity>,
    pub open_only: bool,
    pub limit: Option<usize>,
}

impl EventFilter {
    pub fn between(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
            ..Default::default()
        }
    }
}

#[derive(Clone)]
pub struct AnomalyStore {
    pool: Pool,
}

impl AnomalyStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Append one event. Duplicate logical events are accepted; readers
    /// collapse them.
    pub fn append(&self, event: &AnomalyEvent) -> Result<()> {
        let conn = self.pool.get()?;
        let tags_json = serde_json::to_string(&event.tags)?;

        conn.execute(
            "INSERT INTO anomaly_events
                (id, ts_ms, component, metric_name, host, value, severity, threshold, reason,
                 duration_ms, resolved_ms, cascade_incident_id, tags_json, created_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                event.id.to_string(),
                to_millis(event.timestamp),
                event.component.as_str(),
                event.metric,
                event.host,
                event.value,
                event.severity.as_str(),
                event.threshold,
                event.reason,
                event.duration_estimate_ms,
                event.resolved_at.map(to_millis),
                event.cascade_incident_id.map(|id| id.to_string()),
                tags_json,
                to_millis(Utc::now()),
            ],
        )
        .context("Failed to insert anomaly event")?;

        Ok(())
    }

    /// Earliest timestamp of the open events for one series at or before
    /// `at`; the start of the condition's current streak.
    pub fn open_streak_start(
        &self,
        component: Component,
        metric: &str,
        host: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let conn = self.pool.get()?;
        let ms: Option<i64> = conn.query_row(
            "SELECT MIN(ts_ms) FROM anomaly_events
             WHERE component = ?1 AND metric_name = ?2 AND host = ?3
               AND resolved_ms IS NULL AND ts_ms <= ?4",
            params![component.as_str(), metric, host, to_millis(at)],
            |row| row.get(0),
        )?;
        Ok(ms.map(from_millis))
    }

    /// Mark one event resolved. Returns `false` when it already was.
    pub fn resolve(&self, id: Uuid, resolved_at: DateTime<Utc>) -> Result<bool> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE anomaly_events SET resolved_ms = ?1 WHERE id = ?2 AND resolved_ms IS NULL",
            params![to_millis(resolved_at), id.to_string()],
        )?;
        if changed == 1 {
            return Ok(true);
        }

        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM anomaly_events WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        match exists {
            Some(_) => Ok(false),
            None => Err(DetectError::EventNotFound(id).into()),
        }
    }

    /// Resolve every open event of `severity` whose timestamp is older than
    /// `older_than`. Returns the number of events patched.
    pub fn resolve_older_than(
        &self,
        severity: Severity,
        older_than: DateTime<Utc>,
        resolved_at: DateTime<Utc>,
    ) -> Result<usize> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE anomaly_events SET resolved_ms = ?1
             WHERE resolved_ms IS NULL AND severity = ?2 AND ts_ms < ?3",
            params![
                to_millis(resolved_at),
                severity.as_str(),
                to_millis(older_than)
            ],
        )?;
        Ok(changed)
    }

    pub fn query(&self, filter: &EventFilter) -> Result<Vec<AnomalyEvent>> {
        let conn = self.pool.get()?;

        let mut sql = format!("SELECT {} FROM anomaly_events WHERE 1 = 1", EVENT_COLUMNS);
        let mut args: Vec<rusqlite::types::Value> = Vec::new();
        match (filter.from, filter.created_from) {
            (Some(from), Some(created_from)) => {
                args.push(to_millis(from).into());
                args.push(to_millis(created_from).into());
                sql.push_str(&format!(
                    " AND (ts_ms >= ?{} OR created_ms >= ?{})",
                    args.len() - 1,
                    args.len()
                ));
            }
            (Some(from), None) => {
                args.push(to_millis(from).into());
                sql.push_str(&format!(" AND ts_ms >= ?{}", args.len()));
            }
            (None, Some(created_from)) => {
                args.push(to_millis(created_from).into());
                sql.push_str(&format!(" AND created_ms >= ?{}", args.len()));
            }
            (None, None) => {}
        }
        if let Some(to) = filter.to {
            args.push(to_millis(to).into());
            sql.push_str(&format!(" AND ts_ms <= ?{}", args.len()));
        }
        if let Some(component) = filter.component {
            args.push(component.as_str().to_string().into());
            sql.push_str(&format!(" AND component = ?{}", args.len()));
        }
        if let Some(severity) = filter.severity {
            args.push(severity.as_str().to_string().into());
            sql.push_str(&format!(" AND severity = ?{}", args.len()));
        }
        if filter.open_only {
            sql.push_str(" AND resolved_ms IS NULL");
        }
        sql.push_str(" ORDER BY ts_ms DESC, id ASC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), row_to_event)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read anomaly events")
    }

    pub fn get(&self, id: Uuid) -> Result<Option<AnomalyEvent>> {
        Ok(self.get_many(&[id])?.into_iter().next())
    }

    /// Fetch events by id, returned in the order of `ids`; missing ids are
    /// skipped.
    pub fn get_many(&self, ids: &[Uuid]) -> Result<Vec<AnomalyEvent>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.pool.get()?;
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "SELECT {} FROM anomaly_events WHERE id IN ({})",
            EVENT_COLUMNS, placeholders
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(ids.iter().map(|id| id.to_string())), row_to_event)?;
        let mut found = rows.collect::<rusqlite::Result<Vec<_>>>()?;

        found.sort_by_key(|e| ids.iter().position(|id| *id == e.id));
        Ok(found)
    }

    /// Persist an incident and back-reference its events in one
    /// transaction. Returns `false` when an incident with the same dedupe
    /// key already exists; links for component/metric pairs it does not
    /// yet cover are then merged into it and their events attached to it.
    pub fn record_incident(&self, incident: &CascadeIncident) -> Result<bool> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;

        let chain_json = serde_json::to_string(&incident.chain)?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO cascade_incidents
                (id, dedupe_key, pattern, label, start_ms, end_ms, confidence, chain_json, created_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                incident.id.to_string(),
                incident.dedupe_key,
                incident.pattern.as_str(),
                incident.label,
                to_millis(incident.start),
                to_millis(incident.end),
                incident.confidence,
                chain_json,
                to_millis(Utc::now()),
            ],
        )?;

        let (incident_id, chain) = if inserted == 1 {
            (incident.id, incident.chain.clone())
        } else {
            let (id, stored_json): (String, String) = tx.query_row(
                "SELECT id, chain_json FROM cascade_incidents WHERE dedupe_key = ?1",
                params![incident.dedupe_key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            let mut chain: Vec<ChainLink> = serde_json::from_str(&stored_json)?;
            let known = chain.len();
            for link in &incident.chain {
                let covered = chain.iter().any(|l| {
                    l.event_id == link.event_id
                        || (l.component == link.component && l.metric == link.metric)
                });
                if !covered {
                    chain.push(link.clone());
                }
            }
            if chain.len() > known {
                tx.execute(
                    "UPDATE cascade_incidents
                     SET chain_json = ?1, start_ms = MIN(start_ms, ?2), end_ms = MAX(end_ms, ?3)
                     WHERE id = ?4",
                    params![
                        serde_json::to_string(&chain)?,
                        to_millis(incident.start),
                        to_millis(incident.end),
                        id
                    ],
                )?;
            }
            (Uuid::parse_str(&id)?, chain)
        };

        {
            let mut stmt = tx.prepare(
                "UPDATE anomaly_events SET cascade_incident_id = ?1
                 WHERE id = ?2 AND cascade_incident_id IS NULL",
            )?;
            for link in &chain {
                stmt.execute(params![incident_id.to_string(), link.event_id.to_string()])?;
            }
        }

        tx.commit().context("Failed to commit incident")?;
        Ok(inserted == 1)
    }

    /// Incidents whose [start, end] overlaps [from, to], newest first.
    pub fn incidents_overlapping(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<CascadeIncident>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, dedupe_key, pattern, label, start_ms, end_ms, confidence, chain_json
             FROM cascade_incidents
             WHERE start_ms <= ?2 AND end_ms >= ?1
             ORDER BY start_ms DESC, id ASC",
        )?;
        let rows = stmt.query_map(params![to_millis(from), to_millis(to)], row_to_incident)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read incidents")
    }

    pub fn incident_count(&self) -> Result<usize> {
        let conn = self.pool.get()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM cascade_incidents", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<AnomalyEvent> {
    let id: String = row.get(0)?;
    let component: String = row.get(2)?;
    let severity: String = row.get(6)?;
    let incident_id: Option<String> = row.get(11)?;
    let tags_json: String = row.get(12)?;

    Ok(AnomalyEvent {
        id: parse_column(0, &id)?,
        timestamp: from_millis(row.get(1)?),
        component: parse_column(2, &component)?,
        metric: row.get(3)?,
        host: row.get(4)?,
        value: row.get(5)?,
        severity: parse_column(6, &severity)?,
        threshold: row.get(7)?,
        reason: row.get(8)?,
        duration_estimate_ms: row.get(9)?,
        resolved_at: row.get::<_, Option<i64>>(10)?.map(from_millis),
        cascade_incident_id: incident_id.as_deref().map(|s| parse_column(11, s)).transpose()?,
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
    })
}

fn row_to_incident(row: &rusqlite::Row<'_>) -> rusqlite::Result<CascadeIncident> {
    let id: String = row.get(0)?;
    let pattern: String = row.get(2)?;
    let chain_json: String = row.get(7)?;
    let chain: Vec<ChainLink> = serde_json::from_str(&chain_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(CascadeIncident {
        id: parse_column(0, &id)?,
        dedupe_key: row.get(1)?,
        pattern: parse_column(2, &pattern)?,
        label: row.get(3)?,
        start: from_millis(row.get(4)?),
        end: from_millis(row.get(5)?),
        confidence: row.get(6)?,
        chain,
    })
}
