//! Shift persistence for the copy engine: the `ShiftStore` contract, a
//! salon-scoped Postgres store and a YAML-backed in-memory store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use shiftcopy_core::{
    format_time_of_day, weekday_from_iso, Employee, ExistingShift, Interval, OpeningHours,
    PatternError, WEEKDAYS,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "shiftcopy-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("employee {0} does not belong to this salon")]
    UnknownEmployee(Uuid),
    #[error("invalid stored record: {0}")]
    InvalidRecord(#[from] PatternError),
    #[error("snapshot {path}: {message}")]
    Snapshot { path: PathBuf, message: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("write rejected: {0}")]
    Rejected(String),
}

/// Read and write access to one salon's employees, shifts and opening hours.
#[async_trait]
pub trait ShiftStore: Send + Sync {
    async fn employees(&self) -> Result<Vec<Employee>, StoreError>;

    async fn shifts_for_employee(&self, employee_id: Uuid) -> Result<Vec<ExistingShift>, StoreError>;

    async fn opening_hours(&self) -> Result<OpeningHours, StoreError>;

    async fn create_shift(
        &self,
        employee_id: Uuid,
        weekday: Weekday,
        interval: Interval,
    ) -> Result<(), StoreError>;

    /// Returns the number of shifts removed.
    async fn delete_shifts_for_employee_on_weekday(
        &self,
        employee_id: Uuid,
        weekday: Weekday,
    ) -> Result<u64, StoreError>;
}

fn iso_weekday(weekday: Weekday) -> i16 {
    weekday.number_from_monday() as i16
}

#[derive(Debug, Clone)]
pub struct PgShiftStore {
    pool: PgPool,
    salon_id: Uuid,
}

impl PgShiftStore {
    pub fn new(pool: PgPool, salon_id: Uuid) -> Self {
        Self { pool, salon_id }
    }

    pub async fn connect(database_url: &str, salon_id: Uuid) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        info!(%salon_id, "connected to shift database");
        Ok(Self::new(pool, salon_id))
    }
}

/// Applies the schema in `migrations/`. Tenant-independent, so it takes no salon id.
pub async fn migrate(database_url: &str) -> Result<(), StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(database_url)
        .await?;
    sqlx::migrate!("../../migrations").run(&pool).await?;
    info!("database migrations applied");
    Ok(())
}

#[async_trait]
impl ShiftStore for PgShiftStore {
    async fn employees(&self) -> Result<Vec<Employee>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, display_name
              FROM employees
             WHERE salon_id = $1
             ORDER BY display_name, id
            "#,
        )
        .bind(self.salon_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(Employee {
                id: row.try_get("id")?,
                display_name: row.try_get("display_name")?,
            });
        }
        Ok(out)
    }

    async fn shifts_for_employee(&self, employee_id: Uuid) -> Result<Vec<ExistingShift>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT s.weekday, s.start_time, s.end_time
              FROM employee_shifts s
              JOIN employees e ON e.id = s.employee_id
             WHERE s.employee_id = $1
               AND e.salon_id = $2
             ORDER BY s.weekday, s.start_time
            "#,
        )
        .bind(employee_id)
        .bind(self.salon_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let weekday: i16 = row.try_get("weekday")?;
            let start: NaiveTime = row.try_get("start_time")?;
            let end: NaiveTime = row.try_get("end_time")?;
            out.push(ExistingShift {
                employee_id,
                weekday: weekday_from_iso(weekday.into())?,
                interval: Interval::new(start, end)?,
            });
        }
        debug!(%employee_id, shifts = out.len(), "loaded employee shifts");
        Ok(out)
    }

    async fn opening_hours(&self) -> Result<OpeningHours, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT weekday, open_time, close_time
              FROM opening_hours
             WHERE salon_id = $1
               AND NOT is_closed
            "#,
        )
        .bind(self.salon_id)
        .fetch_all(&self.pool)
        .await?;

        let mut hours = OpeningHours::default();
        for row in rows {
            let weekday: i16 = row.try_get("weekday")?;
            let open: NaiveTime = row.try_get("open_time")?;
            let close: NaiveTime = row.try_get("close_time")?;
            hours.set(weekday_from_iso(weekday.into())?, Some(Interval::new(open, close)?));
        }
        Ok(hours)
    }

    async fn create_shift(
        &self,
        employee_id: Uuid,
        weekday: Weekday,
        interval: Interval,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO employee_shifts (employee_id, weekday, start_time, end_time)
            SELECT e.id, $2, $3, $4
              FROM employees e
             WHERE e.id = $1
               AND e.salon_id = $5
            "#,
        )
        .bind(employee_id)
        .bind(iso_weekday(weekday))
        .bind(interval.start())
        .bind(interval.end())
        .bind(self.salon_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::UnknownEmployee(employee_id));
        }
        Ok(())
    }

    async fn delete_shifts_for_employee_on_weekday(
        &self,
        employee_id: Uuid,
        weekday: Weekday,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM employee_shifts s
             USING employees e
             WHERE s.employee_id = e.id
               AND s.employee_id = $1
               AND s.weekday = $2
               AND e.salon_id = $3
            "#,
        )
        .bind(employee_id)
        .bind(iso_weekday(weekday))
        .bind(self.salon_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

/// On-disk YAML form of a salon: roster, weekly shifts and opening hours.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SalonSnapshot {
    pub salon_id: Uuid,
    #[serde(default)]
    pub opening_hours: Vec<OpeningHoursRow>,
    #[serde(default)]
    pub employees: Vec<EmployeeRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpeningHoursRow {
    pub weekday: i64,
    pub open: String,
    pub close: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmployeeRecord {
    pub id: Uuid,
    pub display_name: String,
    #[serde(default)]
    pub shifts: Vec<ShiftRow>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShiftRow {
    pub weekday: i64,
    pub start: String,
    pub end: String,
}

impl SalonSnapshot {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).await?;
        serde_yaml::from_str(&text).map_err(|err| StoreError::Snapshot {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
    }

    /// Writes through a temp file and rename so readers never see a half-written snapshot.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<(), StoreError> {
        let path = path.as_ref();
        let yaml = serde_yaml::to_string(self).map_err(|err| StoreError::Snapshot {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;

        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).await?;
        let temp_path = parent.join(format!(".{}.snapshot.tmp", Uuid::new_v4()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(yaml.as_bytes()).await?;
        file.flush().await?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err.into());
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    employees: Vec<Employee>,
    shifts: Vec<ExistingShift>,
    opening_hours: OpeningHours,
    /// Remaining writes each employee may perform before every further write is rejected.
    write_budgets: HashMap<Uuid, usize>,
}

impl MemoryState {
    fn charge_write(&mut self, employee_id: Uuid) -> Result<(), StoreError> {
        if !self.employees.iter().any(|e| e.id == employee_id) {
            return Err(StoreError::UnknownEmployee(employee_id));
        }
        match self.write_budgets.get_mut(&employee_id) {
            Some(0) => Err(StoreError::Rejected(format!(
                "writes disabled for employee {employee_id}"
            ))),
            Some(remaining) => {
                *remaining -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

/// Process-local store. Used by tests, demos and the snapshot-file mode of the CLI.
#[derive(Debug)]
pub struct MemoryShiftStore {
    salon_id: Uuid,
    state: Mutex<MemoryState>,
}

impl MemoryShiftStore {
    pub fn new(
        salon_id: Uuid,
        employees: Vec<Employee>,
        shifts: Vec<ExistingShift>,
        opening_hours: OpeningHours,
    ) -> Self {
        Self {
            salon_id,
            state: Mutex::new(MemoryState {
                employees,
                shifts,
                opening_hours,
                write_budgets: HashMap::new(),
            }),
        }
    }

    pub fn from_snapshot(snapshot: &SalonSnapshot) -> Result<Self, StoreError> {
        let mut opening_hours = OpeningHours::default();
        for row in &snapshot.opening_hours {
            opening_hours.set(
                weekday_from_iso(row.weekday)?,
                Some(Interval::parse(&row.open, &row.close)?),
            );
        }

        let mut employees = Vec::with_capacity(snapshot.employees.len());
        let mut shifts = Vec::new();
        for record in &snapshot.employees {
            employees.push(Employee {
                id: record.id,
                display_name: record.display_name.clone(),
            });
            for row in &record.shifts {
                shifts.push(ExistingShift {
                    employee_id: record.id,
                    weekday: weekday_from_iso(row.weekday)?,
                    interval: Interval::parse(&row.start, &row.end)?,
                });
            }
        }
        Ok(Self::new(snapshot.salon_id, employees, shifts, opening_hours))
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let snapshot = SalonSnapshot::load(path).await?;
        Self::from_snapshot(&snapshot)
    }

    pub async fn snapshot(&self) -> SalonSnapshot {
        let state = self.state.lock().await;
        let opening_hours = WEEKDAYS
            .into_iter()
            .filter_map(|weekday| {
                state.opening_hours.lookup(weekday).map(|hours| OpeningHoursRow {
                    weekday: weekday.number_from_monday().into(),
                    open: format_time_of_day(hours.start()),
                    close: format_time_of_day(hours.end()),
                })
            })
            .collect();
        let employees = state
            .employees
            .iter()
            .map(|employee| EmployeeRecord {
                id: employee.id,
                display_name: employee.display_name.clone(),
                shifts: state
                    .shifts
                    .iter()
                    .filter(|s| s.employee_id == employee.id)
                    .map(|s| ShiftRow {
                        weekday: s.weekday.number_from_monday().into(),
                        start: format_time_of_day(s.interval.start()),
                        end: format_time_of_day(s.interval.end()),
                    })
                    .collect(),
            })
            .collect();
        SalonSnapshot {
            salon_id: self.salon_id,
            opening_hours,
            employees,
        }
    }

    pub async fn save(&self, path: impl AsRef<Path>) -> Result<(), StoreError> {
        self.snapshot().await.save(path).await
    }

    pub async fn all_shifts(&self) -> Vec<ExistingShift> {
        self.state.lock().await.shifts.clone()
    }

    /// Rejects every further write (create or delete) for the employee.
    pub async fn fail_writes_for(&self, employee_id: Uuid) {
        self.fail_writes_after(employee_id, 0).await;
    }

    /// Lets `allowed` more writes through for the employee, then rejects the rest.
    pub async fn fail_writes_after(&self, employee_id: Uuid, allowed: usize) {
        self.state
            .lock()
            .await
            .write_budgets
            .insert(employee_id, allowed);
    }
}

#[async_trait]
impl ShiftStore for MemoryShiftStore {
    async fn employees(&self) -> Result<Vec<Employee>, StoreError> {
        Ok(self.state.lock().await.employees.clone())
    }

    async fn shifts_for_employee(&self, employee_id: Uuid) -> Result<Vec<ExistingShift>, StoreError> {
        let state = self.state.lock().await;
        if !state.employees.iter().any(|e| e.id == employee_id) {
            return Err(StoreError::UnknownEmployee(employee_id));
        }
        Ok(state
            .shifts
            .iter()
            .filter(|s| s.employee_id == employee_id)
            .copied()
            .collect())
    }

    async fn opening_hours(&self) -> Result<OpeningHours, StoreError> {
        Ok(self.state.lock().await.opening_hours)
    }

    async fn create_shift(
        &self,
        employee_id: Uuid,
        weekday: Weekday,
        interval: Interval,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.charge_write(employee_id)?;
        state.shifts.push(ExistingShift {
            employee_id,
            weekday,
            interval,
        });
        Ok(())
    }

    async fn delete_shifts_for_employee_on_weekday(
        &self,
        employee_id: Uuid,
        weekday: Weekday,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        state.charge_write(employee_id)?;
        let before = state.shifts.len();
        state
            .shifts
            .retain(|s| !(s.employee_id == employee_id && s.weekday == weekday));
        Ok((before - state.shifts.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SAMPLE: &str = r#"
salon_id: 6f1c2a9e-0d1b-4c55-9a43-5b1c0e3f7a10
opening_hours:
  - weekday: 1
    open: "09:00"
    close: "18:00"
  - weekday: 6
    open: "10:00:00"
    close: "14:00:00"
employees:
  - id: 0b6a3c1e-8f0d-4a55-9e71-1f2d3c4b5a60
    display_name: Anna
    shifts:
      - weekday: 1
        start: "09:00"
        end: "13:00"
      - weekday: 3
        start: "12:00"
        end: "18:00"
  - id: 7c9e2b4d-1a3f-4e6b-8d0c-2b4a6c8e0f12
    display_name: Bruno
"#;

    fn anna() -> Uuid {
        Uuid::parse_str("0b6a3c1e-8f0d-4a55-9e71-1f2d3c4b5a60").expect("uuid")
    }

    fn bruno() -> Uuid {
        Uuid::parse_str("7c9e2b4d-1a3f-4e6b-8d0c-2b4a6c8e0f12").expect("uuid")
    }

    fn sample_store() -> MemoryShiftStore {
        let snapshot: SalonSnapshot = serde_yaml::from_str(SAMPLE).expect("yaml");
        MemoryShiftStore::from_snapshot(&snapshot).expect("valid snapshot")
    }

    #[tokio::test]
    async fn snapshot_yaml_loads_roster_shifts_and_hours() {
        let store = sample_store();
        assert_eq!(store.employees().await.expect("employees").len(), 2);

        let shifts = store.shifts_for_employee(anna()).await.expect("shifts");
        assert_eq!(shifts.len(), 2);
        assert_eq!(shifts[1].weekday, Weekday::Wed);

        let hours = store.opening_hours().await.expect("hours");
        assert_eq!(hours.lookup(Weekday::Sat), Some(Interval::parse("10:00", "14:00").expect("iv")));
        assert_eq!(hours.lookup(Weekday::Sun), None);
    }

    #[test]
    fn snapshot_with_malformed_shift_is_rejected() {
        let yaml = SAMPLE.replace("start: \"12:00\"", "start: \"19:00\"");
        let snapshot: SalonSnapshot = serde_yaml::from_str(&yaml).expect("yaml");
        let err = MemoryShiftStore::from_snapshot(&snapshot).expect_err("end before start");
        assert!(matches!(err, StoreError::InvalidRecord(PatternError::InvalidInterval { .. })));
    }

    #[tokio::test]
    async fn delete_is_scoped_to_employee_and_weekday() {
        let store = sample_store();
        let removed = store
            .delete_shifts_for_employee_on_weekday(anna(), Weekday::Mon)
            .await
            .expect("delete");
        assert_eq!(removed, 1);
        let remaining = store.shifts_for_employee(anna()).await.expect("shifts");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].weekday, Weekday::Wed);
    }

    #[tokio::test]
    async fn write_budget_rejects_after_allowed_writes() {
        let store = sample_store();
        let interval = Interval::parse("09:00", "12:00").expect("iv");
        store.fail_writes_after(bruno(), 1).await;

        store
            .create_shift(bruno(), Weekday::Tue, interval)
            .await
            .expect("first write allowed");
        let err = store
            .create_shift(bruno(), Weekday::Thu, interval)
            .await
            .expect_err("second write rejected");
        assert!(matches!(err, StoreError::Rejected(_)));
        assert_eq!(store.shifts_for_employee(bruno()).await.expect("shifts").len(), 1);
    }

    #[tokio::test]
    async fn unknown_employee_is_rejected() {
        let store = sample_store();
        let stranger = Uuid::new_v4();
        let interval = Interval::parse("09:00", "12:00").expect("iv");
        assert!(matches!(
            store.create_shift(stranger, Weekday::Mon, interval).await,
            Err(StoreError::UnknownEmployee(id)) if id == stranger
        ));
    }

    #[tokio::test]
    async fn save_and_reload_preserves_writes() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("salon.yaml");
        let store = sample_store();
        store
            .create_shift(bruno(), Weekday::Fri, Interval::parse("10:00", "16:00").expect("iv"))
            .await
            .expect("create");
        store.save(&path).await.expect("save");

        let reloaded = MemoryShiftStore::load(&path).await.expect("reload");
        let shifts = reloaded.shifts_for_employee(bruno()).await.expect("shifts");
        assert_eq!(shifts.len(), 1);
        assert_eq!(shifts[0].interval.to_string(), "10:00-16:00");
        assert_eq!(
            reloaded.opening_hours().await.expect("hours"),
            store.opening_hours().await.expect("hours")
        );
    }

    #[tokio::test]
    async fn save_keeps_seconds_of_sub_minute_times() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("salon.yaml");
        let store = sample_store();
        let short = Interval::parse("09:00:15", "09:00:45").expect("iv");
        let late = Interval::parse("09:00:30", "17:00").expect("iv");
        store.create_shift(bruno(), Weekday::Tue, short).await.expect("create");
        store.create_shift(bruno(), Weekday::Thu, late).await.expect("create");
        store.save(&path).await.expect("save");

        let yaml = std::fs::read_to_string(&path).expect("read");
        assert!(yaml.contains("09:00:15"));
        assert!(yaml.contains("09:00:45"));

        let reloaded = MemoryShiftStore::load(&path).await.expect("reload");
        let shifts = reloaded.shifts_for_employee(bruno()).await.expect("shifts");
        assert_eq!(shifts.len(), 2);
        assert_eq!(shifts[0].interval, short);
        assert_eq!(shifts[1].interval, late);
        assert_eq!(shifts[1].interval.to_string(), "09:00:30-17:00");
    }
}
