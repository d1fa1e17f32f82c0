//! SQL-backed `RecordDb`, over SQLite via `sqlx`. The trait is synchronous
//! (matching the original's `RecordDB` Protocol); this backend owns a small
//! Tokio runtime to drive `sqlx`'s async pool underneath that sync surface.

use chrono::{DateTime, Utc};
use gbp_types::{Build, BuildRecord};
use sqlx::{Row, SqlitePool};

use crate::{Error, RecordDb, pick_latest_by_build_id, sort_for_machine, with_submitted_default};

pub struct SqlRecordDb {
    pool: SqlitePool,
    rt: tokio::runtime::Runtime,
}

impl SqlRecordDb {
    /// Connect to `database_url` (e.g. `"sqlite::memory:"` or a file path)
    /// and ensure the schema exists.
    pub fn connect(database_url: &str) -> Result<Self, Error> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::Backend(e.to_string()))?;
        let pool = rt
            .block_on(SqlitePool::connect(database_url))
            .map_err(|e| Error::Backend(e.to_string()))?;
        rt.block_on(migrate(&pool))
            .map_err(|e| Error::Backend(e.to_string()))?;
        Ok(Self { pool, rt })
    }

    fn block_on<F: std::future::Future>(&self, fut: F) -> F::Output {
        self.rt.block_on(fut)
    }
}

async fn migrate(pool: &SqlitePool) -> sqlx::Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS build_records (
            machine TEXT NOT NULL,
            build_id TEXT NOT NULL,
            note TEXT,
            logs TEXT,
            keep INTEGER NOT NULL DEFAULT 0,
            submitted TEXT,
            completed TEXT,
            built TEXT,
            PRIMARY KEY (machine, build_id)
        )",
    )
    .execute(pool)
    .await?;
    Ok(())
}

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> BuildRecord {
    BuildRecord {
        build: Build {
            machine: row.get("machine"),
            build_id: row.get("build_id"),
        },
        note: row.get("note"),
        logs: row.get("logs"),
        keep: row.get::<i64, _>("keep") != 0,
        submitted: parse_ts(row.get("submitted")),
        completed: parse_ts(row.get("completed")),
        built: parse_ts(row.get("built")),
    }
}

fn parse_ts(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn fmt_ts(ts: Option<DateTime<Utc>>) -> Option<String> {
    ts.map(|t| t.to_rfc3339())
}

impl RecordDb for SqlRecordDb {
    fn save(&self, record: BuildRecord) -> Result<BuildRecord, Error> {
        let record = with_submitted_default(record, Utc::now());
        self.block_on(async {
            sqlx::query(
                "INSERT INTO build_records
                    (machine, build_id, note, logs, keep, submitted, completed, built)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(machine, build_id) DO UPDATE SET
                    note = excluded.note,
                    logs = excluded.logs,
                    keep = excluded.keep,
                    submitted = excluded.submitted,
                    completed = excluded.completed,
                    built = excluded.built",
            )
            .bind(&record.build.machine)
            .bind(&record.build.build_id)
            .bind(&record.note)
            .bind(&record.logs)
            .bind(record.keep as i64)
            .bind(fmt_ts(record.submitted))
            .bind(fmt_ts(record.completed))
            .bind(fmt_ts(record.built))
            .execute(&self.pool)
            .await
        })
        .map_err(|e| Error::Backend(e.to_string()))?;
        Ok(record)
    }

    fn get(&self, build: &Build) -> Result<BuildRecord, Error> {
        let row = self
            .block_on(
                sqlx::query("SELECT * FROM build_records WHERE machine = ? AND build_id = ?")
                    .bind(&build.machine)
                    .bind(&build.build_id)
                    .fetch_optional(&self.pool),
            )
            .map_err(|e| Error::Backend(e.to_string()))?;
        row.as_ref()
            .map(row_to_record)
            .ok_or_else(|| Error::NotFound(build.clone()))
    }

    fn exists(&self, build: &Build) -> bool {
        self.get(build).is_ok()
    }

    fn delete(&self, build: &Build) -> Result<(), Error> {
        self.block_on(
            sqlx::query("DELETE FROM build_records WHERE machine = ? AND build_id = ?")
                .bind(&build.machine)
                .bind(&build.build_id)
                .execute(&self.pool),
        )
        .map_err(|e| Error::Backend(e.to_string()))?;
        Ok(())
    }

    fn for_machine(&self, machine: &str) -> Result<Vec<BuildRecord>, Error> {
        let rows = self
            .block_on(
                sqlx::query("SELECT * FROM build_records WHERE machine = ?")
                    .bind(machine)
                    .fetch_all(&self.pool),
            )
            .map_err(|e| Error::Backend(e.to_string()))?;
        let mut records: Vec<BuildRecord> = rows.iter().map(row_to_record).collect();
        sort_for_machine(&mut records);
        Ok(records)
    }

    fn previous(&self, record: &BuildRecord, completed_only: bool) -> Result<Option<BuildRecord>, Error> {
        let Some(built) = record.built else { return Ok(None) };
        Ok(self
            .for_machine(&record.build.machine)?
            .into_iter()
            .filter(|r| !completed_only || r.completed.is_some())
            .filter(|r| r.built.is_some_and(|b| b < built))
            .max_by_key(|r| r.built))
    }

    fn next(&self, record: &BuildRecord, completed_only: bool) -> Result<Option<BuildRecord>, Error> {
        let Some(built) = record.built else { return Ok(None) };
        Ok(self
            .for_machine(&record.build.machine)?
            .into_iter()
            .filter(|r| !completed_only || r.completed.is_some())
            .filter(|r| r.built.is_some_and(|b| b > built))
            .min_by_key(|r| r.built))
    }

    fn latest(&self, machine: &str, completed_only: bool) -> Result<Option<BuildRecord>, Error> {
        let candidates: Vec<BuildRecord> = self
            .for_machine(machine)?
            .into_iter()
            .filter(|r| !completed_only || r.completed.is_some())
            .collect();
        if candidates.iter().any(|r| r.built.is_some()) {
            return Ok(candidates.into_iter().filter(|r| r.built.is_some()).max_by_key(|r| r.built));
        }
        Ok(pick_latest_by_build_id(candidates.iter()).cloned())
    }

    fn list_machines(&self) -> Result<Vec<String>, Error> {
        let rows = self
            .block_on(
                sqlx::query("SELECT DISTINCT machine FROM build_records ORDER BY machine")
                    .fetch_all(&self.pool),
            )
            .map_err(|e| Error::Backend(e.to_string()))?;
        Ok(rows.iter().map(|r| r.get("machine")).collect())
    }

    fn search(&self, machine: &str, field: &str, key: &str) -> Result<Vec<BuildRecord>, Error> {
        let field = crate::SearchField::parse(field)?;
        let column = match field {
            crate::SearchField::Logs => "logs",
            crate::SearchField::Note => "note",
        };
        let sql = format!(
            "SELECT * FROM build_records WHERE machine = ? AND {column} LIKE ? COLLATE NOCASE"
        );
        let pattern = format!("%{key}%");
        let rows = self
            .block_on(
                sqlx::query(&sql)
                    .bind(machine)
                    .bind(pattern)
                    .fetch_all(&self.pool),
            )
            .map_err(|e| Error::Backend(e.to_string()))?;
        Ok(rows.iter().map(row_to_record).collect())
    }

    fn count(&self, machine: Option<&str>) -> Result<usize, Error> {
        let n: i64 = match machine {
            Some(m) => self
                .block_on(
                    sqlx::query_scalar("SELECT COUNT(*) FROM build_records WHERE machine = ?")
                        .bind(m)
                        .fetch_one(&self.pool),
                )
                .map_err(|e| Error::Backend(e.to_string()))?,
            None => self
                .block_on(sqlx::query_scalar("SELECT COUNT(*) FROM build_records").fetch_one(&self.pool))
                .map_err(|e| Error::Backend(e.to_string()))?,
        };
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> SqlRecordDb {
        SqlRecordDb::connect("sqlite::memory:").unwrap()
    }

    #[test]
    fn save_and_get_round_trip() {
        let db = db();
        let build = Build::new("babette", "1").unwrap();
        let saved = db.save(BuildRecord::unsaved(build.clone())).unwrap();
        assert!(saved.submitted.is_some());
        let fetched = db.get(&build).unwrap();
        assert_eq!(fetched.build, build);
    }

    #[test]
    fn save_upserts_existing_record() {
        let db = db();
        let build = Build::new("babette", "1").unwrap();
        db.save(BuildRecord::unsaved(build.clone())).unwrap();
        let mut updated = BuildRecord::unsaved(build.clone());
        updated.note = Some("hi".into());
        db.save(updated).unwrap();
        assert_eq!(db.get(&build).unwrap().note.as_deref(), Some("hi"));
        assert_eq!(db.count(None).unwrap(), 1);
    }

    #[test]
    fn delete_is_idempotent() {
        let db = db();
        let build = Build::new("babette", "1").unwrap();
        db.save(BuildRecord::unsaved(build.clone())).unwrap();
        db.delete(&build).unwrap();
        db.delete(&build).unwrap();
        assert!(!db.exists(&build));
    }

    #[test]
    fn search_rejects_unsearchable_fields() {
        let db = db();
        assert!(matches!(
            db.search("babette", "build_id", "x"),
            Err(Error::NotSearchable(_))
        ));
    }
}
