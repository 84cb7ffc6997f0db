use crate::{
    config::AppConfig,
    entities::{
        appointment::{self, AppointmentStatus, Entity as Appointment},
        clinic::Entity as Clinic,
        clinic_service::{self, Entity as ClinicService},
        staff::{self, Entity as Staff},
        staff_availability::{self, Entity as StaffAvailability},
    },
    errors::ServiceError,
    repositories::require,
};
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc};
use sea_orm::{ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

pub const DEFAULT_GRANULARITY_MINUTES: u32 = 15;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AvailableSlot {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub staff_id: Uuid,
}

/// Half-open interval overlap: `[s1, e1)` and `[s2, e2)` share at least one instant.
pub fn overlaps(
    s1: DateTime<Utc>,
    e1: DateTime<Utc>,
    s2: DateTime<Utc>,
    e2: DateTime<Utc>,
) -> bool {
    s1 < e2 && s2 < e1
}

/// Candidate `(start, end)` pairs inside `[window_start, window_end)`, one every `step`.
pub fn generate_candidates(
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    duration: Duration,
    step: Duration,
) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let mut candidates = Vec::new();
    if duration <= Duration::zero() || step <= Duration::zero() {
        return candidates;
    }
    let mut start = window_start;
    while start + duration <= window_end {
        candidates.push((start, start + duration));
        start += step;
    }
    candidates
}

/// Availability window `start..end` on `date`, in UTC.
pub(crate) fn window_on(
    date: NaiveDate,
    start: NaiveTime,
    end: NaiveTime,
) -> (DateTime<Utc>, DateTime<Utc>) {
    (
        date.and_time(start).and_utc(),
        date.and_time(end).and_utc(),
    )
}

/// 0 = Sunday, matching `staff_availability.day_of_week`.
pub(crate) fn day_of_week(date: NaiveDate) -> i16 {
    date.weekday().num_days_from_sunday() as i16
}

/// Computes bookable slots from staff working hours minus existing appointments. Read-only.
#[derive(Clone)]
pub struct AvailabilityCalculator {
    db: Arc<DatabaseConnection>,
    granularity: Duration,
}

impl AvailabilityCalculator {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            db,
            granularity: Duration::minutes(i64::from(DEFAULT_GRANULARITY_MINUTES)),
        }
    }

    pub fn with_granularity(mut self, minutes: u32) -> Self {
        self.granularity = Duration::minutes(i64::from(minutes.max(1)));
        self
    }

    pub fn with_config(self, cfg: &AppConfig) -> Self {
        self.with_granularity(cfg.slot_granularity_minutes)
    }

    #[instrument(skip(self))]
    pub async fn compute_available_slots(
        &self,
        clinic_id: Uuid,
        service_id: Uuid,
        date: NaiveDate,
        staff_id: Option<Uuid>,
    ) -> Result<Vec<AvailableSlot>, ServiceError> {
        let db = &*self.db;
        require::<Clinic, _>(db, clinic_id, "Clinic").await?;
        let service = require::<ClinicService, _>(db, service_id, "Service").await?;
        check_service(&service, clinic_id)?;

        let staff_ids = self.staff_for(db, clinic_id, staff_id).await?;
        if staff_ids.is_empty() {
            return Ok(Vec::new());
        }

        let windows = StaffAvailability::find()
            .filter(staff_availability::Column::ClinicId.eq(clinic_id))
            .filter(staff_availability::Column::StaffId.is_in(staff_ids.clone()))
            .filter(staff_availability::Column::DayOfWeek.eq(day_of_week(date)))
            .all(db)
            .await?;
        if windows.is_empty() {
            debug!(%date, "No availability on this weekday");
            return Ok(Vec::new());
        }

        let day_start = date.and_time(NaiveTime::MIN).and_utc();
        let day_end = day_start + Duration::days(1);
        let booked = blocking_appointments(db, &staff_ids, day_start, day_end).await?;

        let duration = service.duration();
        let mut slots: Vec<AvailableSlot> = windows
            .iter()
            .flat_map(|window| {
                let (start, end) = window_on(date, window.start_time, window.end_time);
                let staff_id = window.staff_id;
                let busy = booked.get(&staff_id);
                generate_candidates(start, end, duration, self.granularity)
                    .into_iter()
                    .filter(move |(s, e)| {
                        busy.map_or(true, |list| {
                            !list.iter().any(|(bs, be)| overlaps(*s, *e, *bs, *be))
                        })
                    })
                    .map(move |(start_time, end_time)| AvailableSlot {
                        start_time,
                        end_time,
                        staff_id,
                    })
            })
            .collect();

        slots.sort_by(|a, b| {
            a.start_time
                .cmp(&b.start_time)
                .then_with(|| a.staff_id.cmp(&b.staff_id))
                .then_with(|| a.end_time.cmp(&b.end_time))
        });
        slots.dedup();
        debug!(slots = slots.len(), "Computed available slots");
        Ok(slots)
    }

    async fn staff_for<C: ConnectionTrait>(
        &self,
        conn: &C,
        clinic_id: Uuid,
        staff_id: Option<Uuid>,
    ) -> Result<Vec<Uuid>, ServiceError> {
        match staff_id {
            Some(id) => {
                let member = require::<Staff, _>(conn, id, "Staff member").await?;
                if member.clinic_id != clinic_id {
                    return Err(ServiceError::NotFound(format!(
                        "Staff member {} does not work at clinic {}",
                        id, clinic_id
                    )));
                }
                Ok(if member.active { vec![id] } else { Vec::new() })
            }
            None => Ok(Staff::find()
                .filter(staff::Column::ClinicId.eq(clinic_id))
                .filter(staff::Column::Active.eq(true))
                .all(conn)
                .await?
                .into_iter()
                .map(|s| s.id)
                .collect()),
        }
    }
}

/// Busy intervals per staff member that touch `[from, to)`.
///
/// The SQL filter is a day wider on each side; the exact overlap test runs on the
/// loaded rows.
pub(crate) async fn blocking_appointments<C: ConnectionTrait>(
    conn: &C,
    staff_ids: &[Uuid],
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<HashMap<Uuid, Vec<(DateTime<Utc>, DateTime<Utc>)>>, ServiceError> {
    let rows = Appointment::find()
        .filter(appointment::Column::StaffId.is_in(staff_ids.to_vec()))
        .filter(appointment::Column::Status.ne(AppointmentStatus::Cancelled))
        .filter(appointment::Column::StartTime.lt(to + Duration::days(1)))
        .filter(appointment::Column::EndTime.gt(from - Duration::days(1)))
        .all(conn)
        .await?;

    let mut busy: HashMap<Uuid, Vec<(DateTime<Utc>, DateTime<Utc>)>> = HashMap::new();
    for row in rows {
        if row.status.blocks_slot() && row.overlaps(from, to) {
            busy.entry(row.staff_id)
                .or_default()
                .push((row.start_time, row.end_time));
        }
    }
    Ok(busy)
}

/// Whether `[start, end)` fits wholly inside one availability window on its own day.
pub(crate) fn fits_window(
    windows: &[staff_availability::Model],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> bool {
    let date = start.date_naive();
    windows.iter().any(|w| {
        let (ws, we) = window_on(date, w.start_time, w.end_time);
        ws <= start && end <= we
    })
}

/// The service must belong to `clinic_id` and be active.
pub(crate) fn check_service(
    service: &clinic_service::Model,
    clinic_id: Uuid,
) -> Result<(), ServiceError> {
    if service.clinic_id != clinic_id {
        return Err(ServiceError::NotFound(format!(
            "Service {} not offered at clinic {}",
            service.id, clinic_id
        )));
    }
    if !service.active {
        return Err(ServiceError::ValidationError(format!(
            "Service {} is not bookable",
            service.name
        )));
    }
    Ok(())
}
