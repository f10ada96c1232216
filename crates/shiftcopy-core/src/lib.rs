//! Core model for copying weekly shift patterns onto employees.
//!
//! Everything here is pure: intervals, week patterns, the per-target conflict
//! analysis and the aggregate types produced by a batch copy. Persistence lives
//! in `shiftcopy-storage`, orchestration in `shiftcopy-sync`.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveTime, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "shiftcopy-core";

/// ISO week order, Monday first.
pub const WEEKDAYS: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    #[error("interval end {end} must be after start {start}")]
    InvalidInterval { start: NaiveTime, end: NaiveTime },
    #[error("weekday {0} is outside the ISO range 1-7")]
    InvalidWeekday(i64),
    #[error("invalid time of day {0:?}")]
    InvalidTime(String),
    #[error("no interval at index {index} on {weekday}")]
    IntervalIndex { weekday: Weekday, index: usize },
    #[error("unknown copy strategy {0:?} (expected additive or replace)")]
    UnknownStrategy(String),
}

pub fn weekday_from_iso(iso: i64) -> Result<Weekday, PatternError> {
    match iso {
        1..=7 => Ok(WEEKDAYS[(iso - 1) as usize]),
        _ => Err(PatternError::InvalidWeekday(iso)),
    }
}

fn weekday_slot(weekday: Weekday) -> usize {
    weekday.num_days_from_monday() as usize
}

/// Accepts `HH:MM` and the `HH:MM:SS` form Postgres hands back for `time` columns.
pub fn parse_time_of_day(raw: &str) -> Result<NaiveTime, PatternError> {
    let raw = raw.trim();
    NaiveTime::parse_from_str(raw, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M"))
        .map_err(|_| PatternError::InvalidTime(raw.to_string()))
}

/// `HH:MM`, or `HH:MM:SS` when the seconds are non-zero. Inverse of `parse_time_of_day`.
pub fn format_time_of_day(time: NaiveTime) -> String {
    if time.second() == 0 {
        time.format("%H:%M").to_string()
    } else {
        time.format("%H:%M:%S").to_string()
    }
}

/// A same-day span of wall-clock time. `start < end` holds for every value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "IntervalRepr", into = "IntervalRepr")]
pub struct Interval {
    start: NaiveTime,
    end: NaiveTime,
}

#[derive(Serialize, Deserialize)]
struct IntervalRepr {
    start: String,
    end: String,
}

impl TryFrom<IntervalRepr> for Interval {
    type Error = PatternError;

    fn try_from(repr: IntervalRepr) -> Result<Self, Self::Error> {
        Interval::parse(&repr.start, &repr.end)
    }
}

impl From<Interval> for IntervalRepr {
    fn from(interval: Interval) -> Self {
        Self {
            start: format_time_of_day(interval.start),
            end: format_time_of_day(interval.end),
        }
    }
}

impl Interval {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Result<Self, PatternError> {
        if end <= start {
            return Err(PatternError::InvalidInterval { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn parse(start: &str, end: &str) -> Result<Self, PatternError> {
        Self::new(parse_time_of_day(start)?, parse_time_of_day(end)?)
    }

    pub fn start(&self) -> NaiveTime {
        self.start
    }

    pub fn end(&self) -> NaiveTime {
        self.end
    }

    pub fn minutes(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }

    /// Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Interval) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn is_duplicate(&self, other: &Interval) -> bool {
        self.start == other.start && self.end == other.end
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}",
            format_time_of_day(self.start),
            format_time_of_day(self.end)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DayPattern {
    pub enabled: bool,
    #[serde(default)]
    pub intervals: Vec<Interval>,
}

impl DayPattern {
    /// Intervals this day contributes; a disabled day contributes none regardless of what it stores.
    pub fn effective_intervals(&self) -> &[Interval] {
        if self.enabled {
            &self.intervals
        } else {
            &[]
        }
    }

    pub fn is_active(&self) -> bool {
        !self.effective_intervals().is_empty()
    }
}

/// Proposed weekly availability, one slot per ISO weekday.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WeekPattern {
    days: [DayPattern; 7],
}

impl WeekPattern {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Groups one employee's shifts by weekday. Shifts of other employees are ignored.
    pub fn from_shifts(employee_id: Uuid, shifts: &[ExistingShift]) -> Self {
        let mut pattern = Self::empty();
        for shift in shifts.iter().filter(|s| s.employee_id == employee_id) {
            pattern.add_interval(shift.weekday, shift.interval);
        }
        pattern
    }

    pub fn from_opening_hours(lookup: impl Fn(Weekday) -> Option<Interval>) -> Self {
        let mut pattern = Self::empty();
        for weekday in WEEKDAYS {
            if let Some(interval) = lookup(weekday) {
                pattern.add_interval(weekday, interval);
            }
        }
        pattern
    }

    pub fn day(&self, weekday: Weekday) -> &DayPattern {
        &self.days[weekday_slot(weekday)]
    }

    pub fn day_mut(&mut self, weekday: Weekday) -> &mut DayPattern {
        &mut self.days[weekday_slot(weekday)]
    }

    pub fn days(&self) -> impl Iterator<Item = (Weekday, &DayPattern)> {
        WEEKDAYS.into_iter().zip(self.days.iter())
    }

    /// Days that are enabled and hold at least one interval.
    pub fn active_days(&self) -> impl Iterator<Item = (Weekday, &DayPattern)> {
        self.days().filter(|(_, day)| day.is_active())
    }

    pub fn set_enabled(&mut self, weekday: Weekday, enabled: bool) {
        self.day_mut(weekday).enabled = enabled;
    }

    pub fn add_interval(&mut self, weekday: Weekday, interval: Interval) {
        let day = self.day_mut(weekday);
        day.enabled = true;
        day.intervals.push(interval);
    }

    pub fn update_interval(
        &mut self,
        weekday: Weekday,
        index: usize,
        interval: Interval,
    ) -> Result<(), PatternError> {
        let slot = self
            .day_mut(weekday)
            .intervals
            .get_mut(index)
            .ok_or(PatternError::IntervalIndex { weekday, index })?;
        *slot = interval;
        Ok(())
    }

    pub fn remove_interval(&mut self, weekday: Weekday, index: usize) -> Result<Interval, PatternError> {
        let day = self.day_mut(weekday);
        if index >= day.intervals.len() {
            return Err(PatternError::IntervalIndex { weekday, index });
        }
        Ok(day.intervals.remove(index))
    }

    pub fn copy_day(&mut self, from: Weekday, to: &[Weekday]) {
        let source = self.day(from).clone();
        for &weekday in to.iter().filter(|&&w| w != from) {
            *self.day_mut(weekday) = source.clone();
        }
    }
}

/// Total weekly hours of a pattern, rounded to one decimal place.
pub fn calc_hours(pattern: &WeekPattern) -> f64 {
    let minutes: i64 = pattern
        .days()
        .flat_map(|(_, day)| day.effective_intervals())
        .map(Interval::minutes)
        .sum();
    (minutes as f64 / 60.0 * 10.0).round() / 10.0
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Employee {
    pub id: Uuid,
    pub display_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistingShift {
    pub employee_id: Uuid,
    pub weekday: Weekday,
    pub interval: Interval,
}

/// Read-only view of existing shifts keyed by employee.
#[derive(Debug, Clone, Default)]
pub struct ShiftSnapshot {
    by_employee: HashMap<Uuid, Vec<ExistingShift>>,
}

impl ShiftSnapshot {
    pub fn from_shifts(shifts: impl IntoIterator<Item = ExistingShift>) -> Self {
        let mut by_employee: HashMap<Uuid, Vec<ExistingShift>> = HashMap::new();
        for shift in shifts {
            by_employee.entry(shift.employee_id).or_default().push(shift);
        }
        Self { by_employee }
    }

    pub fn shifts_for(&self, employee_id: &Uuid) -> &[ExistingShift] {
        self.by_employee
            .get(employee_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Salon opening hours, `None` meaning closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OpeningHours {
    days: [Option<Interval>; 7],
}

impl OpeningHours {
    pub fn set(&mut self, weekday: Weekday, hours: Option<Interval>) {
        self.days[weekday_slot(weekday)] = hours;
    }

    pub fn lookup(&self, weekday: Weekday) -> Option<Interval> {
        self.days[weekday_slot(weekday)]
    }

    pub fn to_pattern(&self) -> WeekPattern {
        WeekPattern::from_opening_hours(|weekday| self.lookup(weekday))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PatternSource {
    Employee { employee_id: Uuid },
    OpeningHours,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CopyStrategy {
    /// Keep existing shifts; only add where nothing duplicates or overlaps.
    #[default]
    Additive,
    /// Clear the target's shifts on every active pattern day first.
    Replace,
}

impl fmt::Display for CopyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CopyStrategy::Additive => f.write_str("additive"),
            CopyStrategy::Replace => f.write_str("replace"),
        }
    }
}

impl FromStr for CopyStrategy {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "additive" => Ok(CopyStrategy::Additive),
            "replace" => Ok(CopyStrategy::Replace),
            other => Err(PatternError::UnknownStrategy(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DayAction {
    Create,
    SkipDupe,
    SkipOverlap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayDetail {
    pub weekday: Weekday,
    pub interval: Interval,
    pub action: DayAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetAnalysis {
    pub employee_id: Uuid,
    pub to_create: usize,
    pub to_skip: usize,
    pub conflicts: usize,
    pub details: Vec<DayDetail>,
}

impl TargetAnalysis {
    pub fn from_details(employee_id: Uuid, details: Vec<DayDetail>) -> Self {
        let count = |action: DayAction| details.iter().filter(|d| d.action == action).count();
        Self {
            employee_id,
            to_create: count(DayAction::Create),
            to_skip: count(DayAction::SkipDupe),
            conflicts: count(DayAction::SkipOverlap),
            details,
        }
    }

    pub fn creates(&self) -> impl Iterator<Item = &DayDetail> {
        self.details.iter().filter(|d| d.action == DayAction::Create)
    }
}

fn classify(interval: &Interval, against: &[Interval]) -> DayAction {
    if against.iter().any(|other| interval.is_duplicate(other)) {
        DayAction::SkipDupe
    } else if against.iter().any(|other| interval.overlaps(other)) {
        DayAction::SkipOverlap
    } else {
        DayAction::Create
    }
}

/// Classifies one day's intervals in order.
///
/// `blocking` starts as the intervals that already occupy the day. With
/// `accumulate` set every accepted interval joins it, so later intervals of
/// the same day are checked against earlier accepted ones (first write wins).
fn classify_day(
    weekday: Weekday,
    intervals: &[Interval],
    blocking: Vec<Interval>,
    accumulate: bool,
) -> Vec<DayDetail> {
    let (details, _) = intervals.iter().fold(
        (Vec::with_capacity(intervals.len()), blocking),
        |(mut details, mut blocking), interval| {
            let action = classify(interval, &blocking);
            if accumulate && action == DayAction::Create {
                blocking.push(*interval);
            }
            details.push(DayDetail {
                weekday,
                interval: *interval,
                action,
            });
            (details, blocking)
        },
    );
    details
}

/// Dry-run classification of one target's copy.
pub fn analyse_target(
    employee_id: Uuid,
    pattern: &WeekPattern,
    existing: &[ExistingShift],
    strategy: CopyStrategy,
) -> TargetAnalysis {
    let mut details = Vec::new();
    for (weekday, day) in pattern.active_days() {
        let day_details = match strategy {
            CopyStrategy::Additive => {
                let occupied = existing
                    .iter()
                    .filter(|s| s.weekday == weekday)
                    .map(|s| s.interval)
                    .collect();
                classify_day(weekday, day.effective_intervals(), occupied, false)
            }
            CopyStrategy::Replace => {
                classify_day(weekday, day.effective_intervals(), Vec::new(), true)
            }
        };
        details.extend(day_details);
    }
    TargetAnalysis::from_details(employee_id, details)
}

/// Runs [`analyse_target`] for every target, keeping target order.
pub fn analyse_all(
    target_ids: &[Uuid],
    pattern: &WeekPattern,
    snapshot: &ShiftSnapshot,
    strategy: CopyStrategy,
) -> Vec<TargetAnalysis> {
    target_ids
        .iter()
        .map(|id| analyse_target(*id, pattern, snapshot.shifts_for(id), strategy))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CopySummary {
    pub total_create: usize,
    pub total_skip: usize,
    pub total_conflict: usize,
    pub target_count: usize,
}

impl CopySummary {
    pub fn from_analyses(analyses: &[TargetAnalysis]) -> Self {
        analyses.iter().fold(
            Self {
                target_count: analyses.len(),
                ..Self::default()
            },
            |mut acc, a| {
                acc.total_create += a.to_create;
                acc.total_skip += a.to_skip;
                acc.total_conflict += a.conflicts;
                acc
            },
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetOutcome {
    pub employee_id: Uuid,
    /// Shifts actually written, including those written before a failure.
    pub created: usize,
    pub skipped: usize,
    pub deleted: u64,
    pub error: Option<String>,
}

impl TargetOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyResult {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub created: usize,
    pub skipped: usize,
    pub per_target: Vec<TargetOutcome>,
    pub errors: Vec<String>,
}

impl ApplyResult {
    pub fn from_outcomes(
        run_id: Uuid,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        per_target: Vec<TargetOutcome>,
    ) -> Self {
        let errors = per_target
            .iter()
            .filter_map(|o| o.error.as_ref().map(|e| format!("{}: {}", o.employee_id, e)))
            .collect();
        Self {
            run_id,
            started_at,
            finished_at,
            created: per_target.iter().map(|o| o.created).sum(),
            skipped: per_target.iter().map(|o| o.skipped).sum(),
            per_target,
            errors,
        }
    }

    pub fn failed_targets(&self) -> Vec<Uuid> {
        self.per_target
            .iter()
            .filter(|o| !o.is_success())
            .map(|o| o.employee_id)
            .collect()
    }
}
