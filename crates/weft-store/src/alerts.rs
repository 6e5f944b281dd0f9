use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, OptionalExtension, Row};

use weft_core::alert::{ActionResult, AlertIncident, AlertRule, IncidentStatus};
use weft_core::error::Result;
use weft_core::traits::AlertStore;

use crate::store::SqliteStore;
use crate::{db_err, parse_enum, parse_json, parse_opt_ts, parse_ts, ts};

const INCIDENT_COLUMNS: &str =
    "id, rule_id, status, severity, context, action_results, triggered_at, resolved_at";

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

struct IncidentRow {
    id: String,
    rule_id: String,
    status: String,
    severity: String,
    context: String,
    action_results: String,
    triggered_at: String,
    resolved_at: Option<String>,
}

impl IncidentRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            rule_id: row.get(1)?,
            status: row.get(2)?,
            severity: row.get(3)?,
            context: row.get(4)?,
            action_results: row.get(5)?,
            triggered_at: row.get(6)?,
            resolved_at: row.get(7)?,
        })
    }

    fn into_incident(self) -> Result<AlertIncident> {
        Ok(AlertIncident {
            id: self.id,
            rule_id: self.rule_id,
            status: parse_enum(&self.status)?,
            severity: parse_enum(&self.severity)?,
            context: parse_json(&self.context)?,
            action_results: parse_json(&self.action_results)?,
            triggered_at: parse_ts(&self.triggered_at)?,
            resolved_at: parse_opt_ts(self.resolved_at)?,
        })
    }
}

impl AlertStore for SqliteStore {
    fn save_alert_rule(&self, rule: &AlertRule) -> Result<()> {
        let body = serde_json::to_string(rule)?;
        let conn = self.lock()?;
        // Saving a rule without a trigger time keeps the stored one.
        conn.execute(
            "INSERT INTO alert_rules (id, rule, enabled, cooldown_minutes, last_triggered_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                rule = excluded.rule,
                enabled = excluded.enabled,
                cooldown_minutes = excluded.cooldown_minutes,
                last_triggered_ms = COALESCE(excluded.last_triggered_ms, alert_rules.last_triggered_ms)",
            params![
                rule.id,
                body,
                rule.enabled,
                rule.cooldown_minutes,
                rule.last_triggered_at.map(|t| t.timestamp_millis()),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn list_alert_rules(&self, enabled_only: bool) -> Result<Vec<AlertRule>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT rule, last_triggered_ms FROM alert_rules
                 WHERE (?1 = 0 OR enabled = 1) ORDER BY id",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![enabled_only], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<i64>>(1)?))
            })
            .map_err(db_err)?;

        let mut rules = Vec::new();
        for row in rows {
            let (body, last_ms) = row.map_err(db_err)?;
            let mut rule: AlertRule = parse_json(&body)?;
            rule.last_triggered_at = last_ms.and_then(from_millis);
            rules.push(rule);
        }
        Ok(rules)
    }

    fn claim_rule_trigger(&self, rule_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let now_ms = now.timestamp_millis();
        let conn = self.lock()?;
        let claimed = conn
            .execute(
                "UPDATE alert_rules SET last_triggered_ms = ?2
                 WHERE id = ?1
                   AND (last_triggered_ms IS NULL
                        OR ?2 - last_triggered_ms >= cooldown_minutes * 60000)",
                params![rule_id, now_ms],
            )
            .map_err(db_err)?;
        Ok(claimed == 1)
    }

    fn insert_incident(&self, incident: &AlertIncident) -> Result<()> {
        let context = incident.context.to_string();
        let results = serde_json::to_string(&incident.action_results)?;
        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO alert_incidents ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                INCIDENT_COLUMNS
            ),
            params![
                incident.id,
                incident.rule_id,
                incident.status.as_str(),
                incident.severity.as_str(),
                context,
                results,
                ts(incident.triggered_at),
                incident.resolved_at.map(ts),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn set_incident_actions(&self, id: &str, results: &[ActionResult]) -> Result<bool> {
        let results = serde_json::to_string(results)?;
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE alert_incidents SET action_results = ?2 WHERE id = ?1",
                params![id, results],
            )
            .map_err(db_err)?;
        Ok(changed == 1)
    }

    fn get_incident(&self, id: &str) -> Result<Option<AlertIncident>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM alert_incidents WHERE id = ?1", INCIDENT_COLUMNS),
                params![id],
                IncidentRow::from_row,
            )
            .optional()
            .map_err(db_err)?;
        row.map(IncidentRow::into_incident).transpose()
    }

    fn list_incidents(&self, status: Option<IncidentStatus>) -> Result<Vec<AlertIncident>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM alert_incidents
                 WHERE (?1 IS NULL OR status = ?1)
                 ORDER BY triggered_at DESC",
                INCIDENT_COLUMNS
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![status.map(|s| s.as_str())], IncidentRow::from_row)
            .map_err(db_err)?;

        let mut incidents = Vec::new();
        for row in rows {
            incidents.push(row.map_err(db_err)?.into_incident()?);
        }
        Ok(incidents)
    }

    fn set_incident_status(
        &self,
        id: &str,
        status: IncidentStatus,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        // Acknowledging only applies to active incidents; closing applies to
        // any open one.
        let allowed = match status {
            IncidentStatus::Acknowledged => "('active')",
            _ => "('active', 'acknowledged')",
        };
        let resolved_at = (status == IncidentStatus::Resolved).then(|| ts(at));

        let conn = self.lock()?;
        let changed = conn
            .execute(
                &format!(
                    "UPDATE alert_incidents SET status = ?2, resolved_at = COALESCE(?3, resolved_at)
                     WHERE id = ?1 AND status IN {}",
                    allowed
                ),
                params![id, status.as_str(), resolved_at],
            )
            .map_err(db_err)?;
        Ok(changed == 1)
    }

    fn expire_incidents(&self, before: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE alert_incidents SET status = 'resolved', resolved_at = ?2
             WHERE status = 'active' AND triggered_at < ?1",
            params![ts(before), ts(Utc::now())],
        )
        .map_err(db_err)
    }
}
