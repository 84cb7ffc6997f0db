mod common;

use assert_matches::assert_matches;
use chrono::{DateTime, Utc};
use common::{monday_at, TestApp, MONDAY};
use petcare_core::{
    entities::{appointment::AppointmentStatus, clinic, clinic_service, staff},
    errors::ServiceError,
    events::Event,
    services::scheduling::BookAppointmentRequest,
};
use uuid::Uuid;

struct Fixture {
    clinic: clinic::Model,
    service: clinic_service::Model,
    vet: staff::Model,
}

async fn fixture(app: &TestApp) -> Fixture {
    let (clinic, service) = app.clinic_with_service(60).await;
    let vet = app.staff(clinic.id, &[(MONDAY, "09:00", "12:00")]).await;
    Fixture {
        clinic,
        service,
        vet,
    }
}

fn request(f: &Fixture, start: DateTime<Utc>) -> BookAppointmentRequest {
    BookAppointmentRequest {
        clinic_id: f.clinic.id,
        service_id: f.service.id,
        staff_id: f.vet.id,
        customer_id: Uuid::new_v4(),
        pet_id: Uuid::new_v4(),
        start_time: start,
        notes: Some("Annual vaccines".into()),
    }
}

#[tokio::test]
async fn booking_reserves_the_slot() {
    let mut app = TestApp::new().await;
    let f = fixture(&app).await;
    app.drain_events();

    let booked = app
        .services
        .appointments
        .book_appointment(request(&f, monday_at("09:00")))
        .await
        .unwrap();
    assert_eq!(booked.status, AppointmentStatus::Scheduled);
    assert_eq!(booked.start_time, monday_at("09:00"));
    assert_eq!(booked.end_time, monday_at("10:00"));
    assert_eq!(booked.notes.as_deref(), Some("Annual vaccines"));

    let events = app.drain_events();
    assert!(events.contains(&Event::AppointmentBooked {
        appointment_id: booked.id,
        staff_id: f.vet.id,
    }));

    let slots = app
        .services
        .availability
        .compute_available_slots(f.clinic.id, f.service.id, monday_at("00:00").date_naive(), None)
        .await
        .unwrap();
    assert!(slots.iter().all(|s| s.start_time >= monday_at("10:00")));
    assert_eq!(slots.first().map(|s| s.start_time), Some(monday_at("10:00")));
}

#[tokio::test]
async fn overlapping_booking_is_a_conflict() {
    let app = TestApp::new().await;
    let f = fixture(&app).await;
    let appointments = &app.services.appointments;

    appointments
        .book_appointment(request(&f, monday_at("09:30")))
        .await
        .unwrap();

    for start in ["09:00", "09:30", "10:15"] {
        let err = appointments
            .book_appointment(request(&f, monday_at(start)))
            .await
            .unwrap_err();
        assert_matches!(err, ServiceError::ConflictingSlot(_));
    }
}

#[tokio::test]
async fn touching_intervals_do_not_conflict() {
    let app = TestApp::new().await;
    let f = fixture(&app).await;
    let appointments = &app.services.appointments;

    appointments
        .book_appointment(request(&f, monday_at("10:00")))
        .await
        .unwrap();
    appointments
        .book_appointment(request(&f, monday_at("09:00")))
        .await
        .unwrap();
    appointments
        .book_appointment(request(&f, monday_at("11:00")))
        .await
        .unwrap();
}

#[tokio::test]
async fn cancelled_booking_frees_the_slot() {
    let app = TestApp::new().await;
    let f = fixture(&app).await;
    let appointments = &app.services.appointments;

    let first = appointments
        .book_appointment(request(&f, monday_at("09:00")))
        .await
        .unwrap();
    appointments
        .update_appointment_status(
            first.id,
            AppointmentStatus::Cancelled,
            "front-desk",
            None,
            Some("owner rescheduled"),
        )
        .await
        .unwrap();

    appointments
        .book_appointment(request(&f, monday_at("09:00")))
        .await
        .unwrap();
}

#[tokio::test]
async fn booking_outside_working_hours_is_rejected() {
    let app = TestApp::new().await;
    let f = fixture(&app).await;
    let appointments = &app.services.appointments;

    // Runs past 12:00, starts before 09:00, and a Tuesday
    for start in [
        monday_at("11:30"),
        monday_at("08:30"),
        monday_at("10:00") + chrono::Duration::days(1),
    ] {
        let err = appointments
            .book_appointment(request(&f, start))
            .await
            .unwrap_err();
        assert_matches!(err, ServiceError::ValidationError(_));
    }
}

#[tokio::test]
async fn staff_from_another_clinic_is_not_found() {
    let app = TestApp::new().await;
    let f = fixture(&app).await;
    let (other_clinic, _) = app.clinic_with_service(60).await;
    let outsider = app
        .staff(other_clinic.id, &[(MONDAY, "09:00", "12:00")])
        .await;

    let mut req = request(&f, monday_at("09:00"));
    req.staff_id = outsider.id;
    let err = app
        .services
        .appointments
        .book_appointment(req)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::NotFound(_));
}

#[tokio::test]
async fn confirmed_then_completed() {
    let mut app = TestApp::new().await;
    let f = fixture(&app).await;
    let appointments = app.services.appointments.clone();
    let booked = appointments
        .book_appointment(request(&f, monday_at("09:00")))
        .await
        .unwrap();
    app.drain_events();

    let confirmed = appointments
        .update_appointment_status(booked.id, AppointmentStatus::Confirmed, "front-desk", None, None)
        .await
        .unwrap();
    assert_eq!(confirmed.status, AppointmentStatus::Confirmed);

    let completed = appointments
        .update_appointment_status(
            booked.id,
            AppointmentStatus::Completed,
            "dr-rivera",
            Some("Vaccines given, next visit in a year"),
            None,
        )
        .await
        .unwrap();
    assert_eq!(completed.status, AppointmentStatus::Completed);
    assert!(completed.cancel_reason.is_none());

    let events = app.drain_events();
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, Event::AppointmentStatusChanged { .. }))
            .count(),
        2
    );

    let notes = appointments.list_appointment_notes(booked.id).await.unwrap();
    assert_eq!(notes.len(), 2);
    let generated = notes
        .iter()
        .find(|n| n.to_status == Some(AppointmentStatus::Confirmed))
        .unwrap();
    assert!(generated.body.starts_with("Status changed from"));
    assert_eq!(generated.from_status, Some(AppointmentStatus::Scheduled));
    let written = notes
        .iter()
        .find(|n| n.to_status == Some(AppointmentStatus::Completed))
        .unwrap();
    assert_eq!(written.body, "Vaccines given, next visit in a year");
    assert_eq!(written.actor, "dr-rivera");

    for target in [
        AppointmentStatus::Scheduled,
        AppointmentStatus::Cancelled,
        AppointmentStatus::Completed,
    ] {
        let err = appointments
            .update_appointment_status(booked.id, target, "front-desk", None, Some("late"))
            .await
            .unwrap_err();
        assert_matches!(err, ServiceError::InvalidTransition { .. });
    }
}

#[tokio::test]
async fn scheduled_cannot_jump_to_completed() {
    let app = TestApp::new().await;
    let f = fixture(&app).await;
    let appointments = &app.services.appointments;
    let booked = appointments
        .book_appointment(request(&f, monday_at("09:00")))
        .await
        .unwrap();

    let err = appointments
        .update_appointment_status(booked.id, AppointmentStatus::Completed, "vet", None, None)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidTransition { .. });
    assert_eq!(
        appointments.get_appointment(booked.id).await.unwrap().status,
        AppointmentStatus::Scheduled
    );
}

#[tokio::test]
async fn cancelling_requires_a_reason() {
    let app = TestApp::new().await;
    let f = fixture(&app).await;
    let appointments = &app.services.appointments;
    let booked = appointments
        .book_appointment(request(&f, monday_at("09:00")))
        .await
        .unwrap();

    for reason in [None, Some("   ")] {
        let err = appointments
            .update_appointment_status(booked.id, AppointmentStatus::Cancelled, "owner", None, reason)
            .await
            .unwrap_err();
        assert_matches!(err, ServiceError::ValidationError(_));
    }
    assert!(appointments
        .list_appointment_notes(booked.id)
        .await
        .unwrap()
        .is_empty());

    let cancelled = appointments
        .update_appointment_status(
            booked.id,
            AppointmentStatus::Cancelled,
            "owner",
            None,
            Some("pet is unwell"),
        )
        .await
        .unwrap();
    assert_eq!(cancelled.status, AppointmentStatus::Cancelled);
    assert_eq!(cancelled.cancel_reason.as_deref(), Some("pet is unwell"));
    assert_eq!(cancelled.cancelled_by.as_deref(), Some("owner"));
    assert!(cancelled.cancelled_at.is_some());
}

#[tokio::test]
async fn free_form_notes() {
    let app = TestApp::new().await;
    let f = fixture(&app).await;
    let appointments = &app.services.appointments;
    let booked = appointments
        .book_appointment(request(&f, monday_at("09:00")))
        .await
        .unwrap();

    let note = appointments
        .add_appointment_note(booked.id, "front-desk", "Owner asked for a reminder call")
        .await
        .unwrap();
    assert_eq!(note.from_status, None);
    assert_eq!(note.to_status, None);

    assert_matches!(
        appointments
            .add_appointment_note(booked.id, "front-desk", "  ")
            .await,
        Err(ServiceError::ValidationError(_))
    );
    assert_matches!(
        appointments
            .add_appointment_note(Uuid::new_v4(), "front-desk", "hello")
            .await,
        Err(ServiceError::NotFound(_))
    );

    let notes = appointments.list_appointment_notes(booked.id).await.unwrap();
    let ids: Vec<Uuid> = notes.iter().map(|n| n.id).collect();
    assert_eq!(ids, vec![note.id]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_bookings_for_one_slot_admit_one() {
    let app = TestApp::new().await;
    let f = fixture(&app).await;

    let first = app.services.appointments.clone();
    let second = app.services.appointments.clone();
    let a = request(&f, monday_at("10:00"));
    let b = request(&f, monday_at("10:30"));

    let (ra, rb) = tokio::join!(
        tokio::spawn(async move { first.book_appointment(a).await }),
        tokio::spawn(async move { second.book_appointment(b).await }),
    );
    let results = [ra.unwrap(), rb.unwrap()];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(ServiceError::ConflictingSlot(_)))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_transitions_from_confirmed_apply_exactly_one() {
    let app = TestApp::file_backed(4).await;
    let f = fixture(&app).await;
    let appointments = app.services.appointments.clone();
    let booked = appointments
        .book_appointment(request(&f, monday_at("09:00")))
        .await
        .unwrap();
    appointments
        .update_appointment_status(booked.id, AppointmentStatus::Confirmed, "front-desk", None, None)
        .await
        .unwrap();

    let complete = appointments.clone();
    let cancel = appointments.clone();
    let id = booked.id;
    let (a, b) = tokio::join!(
        tokio::spawn(async move {
            complete
                .update_appointment_status(id, AppointmentStatus::Completed, "dr-rivera", None, None)
                .await
        }),
        tokio::spawn(async move {
            cancel
                .update_appointment_status(id, AppointmentStatus::Cancelled, "owner", None, Some("car broke down"))
                .await
        }),
    );
    let results = [a.unwrap(), b.unwrap()];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let err = results.iter().find_map(|r| r.as_ref().err()).unwrap();
    assert!(
        matches!(err, ServiceError::InvalidTransition { .. }) || err.is_retryable(),
        "unexpected error: {}",
        err
    );

    let winner = results.iter().find_map(|r| r.as_ref().ok()).unwrap();
    let stored = appointments.get_appointment(id).await.unwrap();
    assert_eq!(stored.status, winner.status);
    assert_eq!(
        stored.cancel_reason.is_some(),
        winner.status == AppointmentStatus::Cancelled
    );

    // Confirmation plus exactly one terminal move
    let notes = appointments.list_appointment_notes(id).await.unwrap();
    assert_eq!(notes.len(), 2);
}
