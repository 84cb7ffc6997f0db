use crate::{
    db,
    entities::{
        appointment::{self, AppointmentStatus, Entity as Appointment, Model as AppointmentModel},
        appointment_note::{self, Entity as AppointmentNote},
        clinic::Entity as Clinic,
        clinic_service::Entity as ClinicService,
        staff::{self, Entity as Staff},
        staff_availability::{self, Entity as StaffAvailability},
    },
    errors::ServiceError,
    events::{Event, EventSender},
    repositories::require,
    services::scheduling::availability::{
        blocking_appointments, check_service, day_of_week, fits_window,
    },
};
use chrono::{DateTime, Utc};
use metrics::counter;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BookAppointmentRequest {
    pub clinic_id: Uuid,
    pub service_id: Uuid,
    pub staff_id: Uuid,
    pub customer_id: Uuid,
    pub pet_id: Uuid,
    pub start_time: DateTime<Utc>,
    #[validate(length(max = 2000))]
    pub notes: Option<String>,
}

/// Books appointments and moves them through their lifecycle.
#[derive(Clone)]
pub struct AppointmentService {
    db: Arc<DatabaseConnection>,
    event_sender: EventSender,
}

impl AppointmentService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: EventSender) -> Self {
        Self { db, event_sender }
    }

    /// Commits a chosen slot. Bookings for the same staff member are serialized on
    /// the staff row, so two overlapping requests cannot both succeed.
    #[instrument(skip(self, request), fields(staff_id = %request.staff_id, start = %request.start_time))]
    pub async fn book_appointment(
        &self,
        request: BookAppointmentRequest,
    ) -> Result<AppointmentModel, ServiceError> {
        request.validate()?;
        let started = Instant::now();
        let txn = db::begin(&*self.db).await?;

        require::<Clinic, _>(&txn, request.clinic_id, "Clinic").await?;
        let service = require::<ClinicService, _>(&txn, request.service_id, "Service").await?;
        check_service(&service, request.clinic_id)?;
        let member = require::<Staff, _>(&txn, request.staff_id, "Staff member").await?;
        if member.clinic_id != request.clinic_id {
            return Err(ServiceError::NotFound(format!(
                "Staff member {} does not work at clinic {}",
                member.id, request.clinic_id
            )));
        }
        if !member.active {
            return Err(ServiceError::ValidationError(format!(
                "Staff member {} is not taking appointments",
                member.name
            )));
        }

        let start = request.start_time;
        let end = start + service.duration();

        let windows = StaffAvailability::find()
            .filter(staff_availability::Column::StaffId.eq(member.id))
            .filter(staff_availability::Column::ClinicId.eq(request.clinic_id))
            .filter(staff_availability::Column::DayOfWeek.eq(day_of_week(start.date_naive())))
            .all(&txn)
            .await?;
        if !fits_window(&windows, start, end) {
            return Err(ServiceError::ValidationError(format!(
                "{} to {} is outside the working hours of {}",
                start, end, member.name
            )));
        }

        lock_staff(&txn, member.id).await?;

        let busy = blocking_appointments(&txn, &[member.id], start, end).await?;
        if busy.get(&member.id).map_or(false, |list| !list.is_empty()) {
            counter!("petcare_appointments.conflicts", 1);
            return Err(ServiceError::ConflictingSlot(format!(
                "{} already has an appointment between {} and {}",
                member.name, start, end
            )));
        }

        let now = Utc::now();
        let booked = appointment::ActiveModel {
            id: Set(Uuid::new_v4()),
            clinic_id: Set(request.clinic_id),
            service_id: Set(service.id),
            staff_id: Set(member.id),
            customer_id: Set(request.customer_id),
            pet_id: Set(request.pet_id),
            start_time: Set(start),
            end_time: Set(end),
            status: Set(AppointmentStatus::Scheduled),
            notes: Set(request.notes),
            cancel_reason: Set(None),
            cancelled_by: Set(None),
            cancelled_at: Set(None),
            created_at: Set(now),
            updated_at: Set(None),
        }
        .insert(&txn)
        .await?;

        db::commit(txn, started).await?;
        counter!("petcare_appointments.booked", 1);
        info!(appointment_id = %booked.id, "Appointment booked");

        self.event_sender
            .send_or_log(Event::AppointmentBooked {
                appointment_id: booked.id,
                staff_id: booked.staff_id,
            })
            .await;
        Ok(booked)
    }

    /// Applies a status transition and records it as a note.
    #[instrument(skip(self, note, cancel_reason), fields(appointment_id = %appointment_id, new_status = %new_status))]
    pub async fn update_appointment_status(
        &self,
        appointment_id: Uuid,
        new_status: AppointmentStatus,
        actor: &str,
        note: Option<&str>,
        cancel_reason: Option<&str>,
    ) -> Result<AppointmentModel, ServiceError> {
        let started = Instant::now();
        let txn = db::begin(&*self.db).await?;

        let current = require::<Appointment, _>(&txn, appointment_id, "Appointment").await?;
        let old_status = current.status;
        if !is_valid_transition(old_status, new_status) {
            warn!(%old_status, "Rejected appointment transition");
            return Err(ServiceError::invalid_transition(old_status, new_status));
        }

        let now = Utc::now();
        let mut update = Appointment::update_many()
            .col_expr(appointment::Column::Status, Expr::value(new_status))
            .col_expr(appointment::Column::UpdatedAt, Expr::value(Some(now)));
        let mut updated = AppointmentModel {
            status: new_status,
            updated_at: Some(now),
            ..current
        };
        if new_status == AppointmentStatus::Cancelled {
            let reason = cancel_reason
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .ok_or_else(|| {
                    ServiceError::ValidationError(
                        "A reason is required to cancel an appointment".to_string(),
                    )
                })?;
            update = update
                .col_expr(appointment::Column::CancelReason, Expr::value(Some(reason.to_string())))
                .col_expr(appointment::Column::CancelledBy, Expr::value(Some(actor.to_string())))
                .col_expr(appointment::Column::CancelledAt, Expr::value(Some(now)));
            updated.cancel_reason = Some(reason.to_string());
            updated.cancelled_by = Some(actor.to_string());
            updated.cancelled_at = Some(now);
        }
        // Only applies if nobody moved the appointment since it was read
        let result = update
            .filter(appointment::Column::Id.eq(appointment_id))
            .filter(appointment::Column::Status.eq(old_status))
            .exec(&txn)
            .await?;
        if result.rows_affected != 1 {
            warn!(%old_status, "Appointment changed by a concurrent writer");
            counter!("petcare_appointments.status_conflict", 1);
            return Err(ServiceError::ConcurrentModification(appointment_id));
        }

        let body = match note {
            Some(text) if !text.trim().is_empty() => text.to_string(),
            _ => format!("Status changed from {} to {}", old_status, new_status),
        };
        insert_note(
            &txn,
            appointment_id,
            actor,
            Some(old_status),
            Some(new_status),
            body,
        )
        .await?;

        db::commit(txn, started).await?;
        info!(%old_status, %new_status, actor, "Appointment status updated");

        self.event_sender
            .send_or_log(Event::AppointmentStatusChanged {
                appointment_id,
                old_status: old_status.to_string(),
                new_status: new_status.to_string(),
            })
            .await;
        Ok(updated)
    }

    pub async fn add_appointment_note(
        &self,
        appointment_id: Uuid,
        actor: &str,
        text: &str,
    ) -> Result<appointment_note::Model, ServiceError> {
        if text.trim().is_empty() {
            return Err(ServiceError::ValidationError(
                "Note text is required".to_string(),
            ));
        }
        require::<Appointment, _>(&*self.db, appointment_id, "Appointment").await?;
        insert_note(&*self.db, appointment_id, actor, None, None, text.to_string()).await
    }

    /// Notes oldest first.
    pub async fn list_appointment_notes(
        &self,
        appointment_id: Uuid,
    ) -> Result<Vec<appointment_note::Model>, ServiceError> {
        require::<Appointment, _>(&*self.db, appointment_id, "Appointment").await?;
        Ok(AppointmentNote::find()
            .filter(appointment_note::Column::AppointmentId.eq(appointment_id))
            .order_by_asc(appointment_note::Column::CreatedAt)
            .order_by_asc(appointment_note::Column::Id)
            .all(&*self.db)
            .await?)
    }

    pub async fn get_appointment(&self, appointment_id: Uuid) -> Result<AppointmentModel, ServiceError> {
        require::<Appointment, _>(&*self.db, appointment_id, "Appointment").await
    }
}

pub fn is_valid_transition(from: AppointmentStatus, to: AppointmentStatus) -> bool {
    use AppointmentStatus::*;
    matches!(
        (from, to),
        (Scheduled, Confirmed)
            | (Scheduled, Cancelled)
            | (Scheduled, NoShow)
            | (Confirmed, Completed)
            | (Confirmed, Cancelled)
            | (Confirmed, NoShow)
    )
}

/// Writes the staff row so concurrent bookings for the same person queue behind this transaction.
async fn lock_staff<C: ConnectionTrait>(conn: &C, staff_id: Uuid) -> Result<(), ServiceError> {
    let result = Staff::update_many()
        .col_expr(
            staff::Column::BookingVersion,
            Expr::col(staff::Column::BookingVersion).add(1),
        )
        .filter(staff::Column::Id.eq(staff_id))
        .exec(conn)
        .await?;
    if result.rows_affected != 1 {
        return Err(ServiceError::NotFound(format!(
            "Staff member {} not found",
            staff_id
        )));
    }
    Ok(())
}

async fn insert_note<C: ConnectionTrait>(
    conn: &C,
    appointment_id: Uuid,
    actor: &str,
    from_status: Option<AppointmentStatus>,
    to_status: Option<AppointmentStatus>,
    body: String,
) -> Result<appointment_note::Model, ServiceError> {
    Ok(appointment_note::ActiveModel {
        id: Set(Uuid::new_v4()),
        appointment_id: Set(appointment_id),
        actor: Set(actor.to_string()),
        from_status: Set(from_status),
        to_status: Set(to_status),
        body: Set(body),
        created_at: Set(Utc::now()),
    }
    .insert(conn)
    .await?)
}
