use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::{params, Connection, OpenFlags};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StitchError};

/// One grid cell of the global tiling, in WGS84 degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CellBounds {
    pub lng_min: f64,
    pub lat_min: f64,
    pub lng_max: f64,
    pub lat_max: f64,
}

/// One unit of work: a (scenario, raster, cell) triple plus its completion flag.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub scenario_id: String,
    pub raster_id: String,
    pub bounds: CellBounds,
    pub stitched: bool,
}

/// Wire form of a work item, sent to workers and carried on the dispatch
/// queue. Also the shape a reschedule entry takes when a session is recovered
/// from a dead worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub scenario_id: String,
    pub raster_id: String,
    pub lng_min: f64,
    pub lat_min: f64,
    pub lng_max: f64,
    pub lat_max: f64,
}

impl From<&WorkItem> for JobPayload {
    fn from(item: &WorkItem) -> Self {
        Self {
            scenario_id: item.scenario_id.clone(),
            raster_id: item.raster_id.clone(),
            lng_min: item.bounds.lng_min,
            lat_min: item.bounds.lat_min,
            lng_max: item.bounds.lng_max,
            lat_max: item.bounds.lat_max,
        }
    }
}

/// Tile latitude `[-90, 90)` by longitude `[-180, 180)` into square cells of
/// `step_deg` degrees. Cell edges are computed from integer indices so the
/// tiling has no float-drift gaps or overlaps.
pub fn grid_cells(step_deg: f64) -> Vec<CellBounds> {
    let n_lat = (180.0 / step_deg).round() as i64;
    let n_lng = (360.0 / step_deg).round() as i64;
    let mut cells = Vec::with_capacity((n_lat * n_lng) as usize);
    for lat_idx in 0..n_lat {
        let lat_min = -90.0 + lat_idx as f64 * step_deg;
        for lng_idx in 0..n_lng {
            let lng_min = -180.0 + lng_idx as f64 * step_deg;
            cells.push(CellBounds {
                lng_min,
                lat_min,
                lng_max: lng_min + step_deg,
                lat_max: lat_min + step_deg,
            });
        }
    }
    cells
}

const CREATE_TABLE_SQL: &str = "
    CREATE TABLE job_status (
        scenario_id TEXT NOT NULL,
        raster_id TEXT NOT NULL,
        lng_min REAL NOT NULL,
        lat_min REAL NOT NULL,
        lng_max REAL NOT NULL,
        lat_max REAL NOT NULL,
        stitched INTEGER NOT NULL)";

/// Durable enumeration of every work item and its completion flag.
///
/// Connections are opened per operation: the dispatcher takes a single
/// read-only snapshot of the backlog, and the completion handler performs
/// short single-row updates, so there is no long-lived writer to contend
/// with. A token file beside the database marks a finished initialization;
/// when both exist a restart reuses the catalog instead of recreating it.
#[derive(Debug, Clone)]
pub struct WorkCatalog {
    db_path: PathBuf,
    token_path: PathBuf,
}

impl WorkCatalog {
    pub fn new(workspace_dir: &Path) -> Self {
        let db_path = workspace_dir.join("status_database.sqlite3");
        let token_path = workspace_dir.join("status_database.sqlite3.CREATED");
        Self {
            db_path,
            token_path,
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// True when a previous initialization ran to completion.
    pub fn is_initialized(&self) -> bool {
        self.db_path.exists() && self.token_path.exists()
    }

    /// Initialize the catalog unless a completed one is already on disk.
    /// Returns the number of rows inserted, or `None` if reused.
    pub fn ensure_initialized(
        &self,
        scenarios: &[String],
        rasters: &[String],
        step_deg: f64,
    ) -> Result<Option<usize>> {
        if self.is_initialized() {
            tracing::info!(db = %self.db_path.display(), "Reusing existing work catalog");
            return Ok(None);
        }
        self.initialize(scenarios, rasters, step_deg).map(Some)
    }

    /// Drop and recreate the catalog, bulk-inserting the full cross product
    /// of scenarios x rasters x grid cells, all unstitched.
    pub fn initialize(
        &self,
        scenarios: &[String],
        rasters: &[String],
        step_deg: f64,
    ) -> Result<usize> {
        if self.token_path.exists() {
            std::fs::remove_file(&self.token_path)
                .map_err(|e| StitchError::Catalog(format!("removing stale token: {e}")))?;
        }
        if self.db_path.exists() {
            std::fs::remove_file(&self.db_path)
                .map_err(|e| StitchError::Catalog(format!("removing stale database: {e}")))?;
        }

        let mut conn = Connection::open(&self.db_path)
            .map_err(|e| StitchError::Catalog(format!("creating database: {e}")))?;
        conn.execute(CREATE_TABLE_SQL, [])
            .map_err(|e| StitchError::Catalog(format!("creating table: {e}")))?;

        let cells = grid_cells(step_deg);
        let tx = conn
            .transaction()
            .map_err(|e| StitchError::Catalog(format!("opening transaction: {e}")))?;
        let mut inserted = 0usize;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO job_status (
                        scenario_id, raster_id, lng_min, lat_min, lng_max, lat_max, stitched)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
                )
                .map_err(|e| StitchError::Catalog(format!("preparing insert: {e}")))?;
            for scenario_id in scenarios {
                for raster_id in rasters {
                    for cell in &cells {
                        stmt.execute(params![
                            scenario_id,
                            raster_id,
                            cell.lng_min,
                            cell.lat_min,
                            cell.lng_max,
                            cell.lat_max,
                        ])
                        .map_err(|e| StitchError::Catalog(format!("inserting row: {e}")))?;
                        inserted += 1;
                    }
                }
            }
        }
        tx.commit()
            .map_err(|e| StitchError::Catalog(format!("committing bulk insert: {e}")))?;

        std::fs::write(&self.token_path, Utc::now().to_rfc3339())
            .map_err(|e| StitchError::Catalog(format!("writing token file: {e}")))?;
        tracing::info!(rows = inserted, db = %self.db_path.display(), "Work catalog initialized");
        Ok(inserted)
    }

    /// Read every row, completed or not, over a read-only connection.
    pub fn load_items(&self) -> Result<Vec<WorkItem>> {
        let conn = Connection::open_with_flags(
            &self.db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        let mut stmt = conn.prepare(
            "SELECT scenario_id, raster_id, lng_min, lat_min, lng_max, lat_max, stitched
             FROM job_status",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(WorkItem {
                scenario_id: row.get(0)?,
                raster_id: row.get(1)?,
                bounds: CellBounds {
                    lng_min: row.get(2)?,
                    lat_min: row.get(3)?,
                    lng_max: row.get(4)?,
                    lat_max: row.get(5)?,
                },
                stitched: row.get::<_, i64>(6)? != 0,
            })
        })?;
        let items = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(items)
    }

    /// Snapshot every unstitched row over a read-only connection, so the
    /// backlog read never blocks or mutates concurrent completion writes.
    pub fn load_backlog(&self) -> Result<Vec<JobPayload>> {
        let conn = Connection::open_with_flags(
            &self.db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        let mut stmt = conn.prepare(
            "SELECT scenario_id, raster_id, lng_min, lat_min, lng_max, lat_max
             FROM job_status
             WHERE stitched = 0",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(JobPayload {
                scenario_id: row.get(0)?,
                raster_id: row.get(1)?,
                lng_min: row.get(2)?,
                lat_min: row.get(3)?,
                lng_max: row.get(4)?,
                lat_max: row.get(5)?,
            })
        })?;
        let backlog = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(backlog)
    }

    /// Mark a completed item's row `stitched = 1`. Returns whether a row
    /// matched. Bounds compare exactly: both sides originate from the same
    /// integer-indexed grid generation.
    pub fn mark_stitched(&self, payload: &JobPayload) -> Result<bool> {
        let conn = Connection::open(&self.db_path)?;
        let updated = conn.execute(
            "UPDATE job_status SET stitched = 1
             WHERE scenario_id = ?1 AND raster_id = ?2
               AND lng_min = ?3 AND lat_min = ?4 AND lng_max = ?5 AND lat_max = ?6",
            params![
                payload.scenario_id,
                payload.raster_id,
                payload.lng_min,
                payload.lat_min,
                payload.lng_max,
                payload.lat_max,
            ],
        )?;
        Ok(updated > 0)
    }
}
