mod common;

use assert_matches::assert_matches;
use common::{monday_at, TestApp, MONDAY};
use petcare_core::{
    entities::{appointment::AppointmentStatus, clinic_service, staff},
    errors::ServiceError,
};
use sea_orm::{ActiveModelTrait, Set};
use uuid::Uuid;

fn monday() -> chrono::NaiveDate {
    monday_at("00:00").date_naive()
}

#[tokio::test]
async fn appointment_straddling_both_hourly_candidates_leaves_nothing() {
    let app = TestApp::with_config(|cfg| cfg.slot_granularity_minutes = 60).await;
    let (clinic, service) = app.clinic_with_service(60).await;
    let vet = app.staff(clinic.id, &[(MONDAY, "09:00", "11:00")]).await;
    app.existing_appointment(
        clinic.id,
        service.id,
        vet.id,
        monday_at("09:30"),
        monday_at("10:30"),
        AppointmentStatus::Scheduled,
    )
    .await;

    let slots = app
        .services
        .availability
        .compute_available_slots(clinic.id, service.id, monday(), None)
        .await
        .unwrap();
    assert!(slots.is_empty());
}

#[tokio::test]
async fn only_the_slot_after_an_early_appointment_remains() {
    let app = TestApp::new().await;
    let (clinic, service) = app.clinic_with_service(60).await;
    let vet = app.staff(clinic.id, &[(MONDAY, "09:00", "11:00")]).await;
    app.existing_appointment(
        clinic.id,
        service.id,
        vet.id,
        monday_at("09:00"),
        monday_at("10:00"),
        AppointmentStatus::Confirmed,
    )
    .await;

    let slots = app
        .services
        .availability
        .compute_available_slots(clinic.id, service.id, monday(), None)
        .await
        .unwrap();
    assert_eq!(slots.len(), 1);
    assert_eq!(slots[0].start_time, monday_at("10:00"));
    assert_eq!(slots[0].end_time, monday_at("11:00"));
    assert_eq!(slots[0].staff_id, vet.id);
}

#[tokio::test]
async fn free_window_yields_every_step() {
    let app = TestApp::new().await;
    let (clinic, service) = app.clinic_with_service(30).await;
    app.staff(clinic.id, &[(MONDAY, "09:00", "10:00")]).await;

    let slots = app
        .services
        .availability
        .compute_available_slots(clinic.id, service.id, monday(), None)
        .await
        .unwrap();
    let starts: Vec<_> = slots.iter().map(|s| s.start_time).collect();
    assert_eq!(
        starts,
        vec![monday_at("09:00"), monday_at("09:15"), monday_at("09:30")]
    );
    assert!(slots.iter().all(|s| s.end_time <= monday_at("10:00")));
}

#[tokio::test]
async fn cancelled_appointments_do_not_block() {
    let app = TestApp::with_config(|cfg| cfg.slot_granularity_minutes = 60).await;
    let (clinic, service) = app.clinic_with_service(60).await;
    let vet = app.staff(clinic.id, &[(MONDAY, "09:00", "11:00")]).await;
    app.existing_appointment(
        clinic.id,
        service.id,
        vet.id,
        monday_at("09:00"),
        monday_at("10:00"),
        AppointmentStatus::Cancelled,
    )
    .await;

    let slots = app
        .services
        .availability
        .compute_available_slots(clinic.id, service.id, monday(), None)
        .await
        .unwrap();
    assert_eq!(slots.len(), 2);
}

#[tokio::test]
async fn no_working_hours_means_no_slots() {
    let app = TestApp::new().await;
    let (clinic, service) = app.clinic_with_service(30).await;
    // Works Tuesdays only
    app.staff(clinic.id, &[(2, "09:00", "17:00")]).await;

    let slots = app
        .services
        .availability
        .compute_available_slots(clinic.id, service.id, monday(), None)
        .await
        .unwrap();
    assert!(slots.is_empty());
}

#[tokio::test]
async fn service_longer_than_the_window_has_no_slots() {
    let app = TestApp::new().await;
    let (clinic, service) = app.clinic_with_service(90).await;
    app.staff(clinic.id, &[(MONDAY, "09:00", "10:00")]).await;

    let slots = app
        .services
        .availability
        .compute_available_slots(clinic.id, service.id, monday(), None)
        .await
        .unwrap();
    assert!(slots.is_empty());
}

#[tokio::test]
async fn staff_filter_limits_results_to_one_person() {
    let app = TestApp::with_config(|cfg| cfg.slot_granularity_minutes = 60).await;
    let (clinic, service) = app.clinic_with_service(60).await;
    let first = app.staff(clinic.id, &[(MONDAY, "09:00", "10:00")]).await;
    let second = app.staff(clinic.id, &[(MONDAY, "09:00", "10:00")]).await;

    let everyone = app
        .services
        .availability
        .compute_available_slots(clinic.id, service.id, monday(), None)
        .await
        .unwrap();
    assert_eq!(everyone.len(), 2);
    assert!(everyone.iter().any(|s| s.staff_id == first.id));
    assert!(everyone.iter().any(|s| s.staff_id == second.id));

    let only_second = app
        .services
        .availability
        .compute_available_slots(clinic.id, service.id, monday(), Some(second.id))
        .await
        .unwrap();
    assert_eq!(only_second.len(), 1);
    assert_eq!(only_second[0].staff_id, second.id);
}

#[tokio::test]
async fn inactive_staff_are_skipped() {
    let app = TestApp::new().await;
    let (clinic, service) = app.clinic_with_service(60).await;
    let vet = app.staff(clinic.id, &[(MONDAY, "09:00", "10:00")]).await;
    let mut retired: staff::ActiveModel = vet.clone().into();
    retired.active = Set(false);
    retired.update(app.db()).await.unwrap();

    for filter in [None, Some(vet.id)] {
        let slots = app
            .services
            .availability
            .compute_available_slots(clinic.id, service.id, monday(), filter)
            .await
            .unwrap();
        assert!(slots.is_empty());
    }
}

#[tokio::test]
async fn service_from_another_clinic_is_not_found() {
    let app = TestApp::new().await;
    let (clinic, _) = app.clinic_with_service(30).await;
    let (_, foreign_service) = app.clinic_with_service(30).await;

    let err = app
        .services
        .availability
        .compute_available_slots(clinic.id, foreign_service.id, monday(), None)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::NotFound(_));

    let err = app
        .services
        .availability
        .compute_available_slots(Uuid::new_v4(), foreign_service.id, monday(), None)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::NotFound(_));
}

#[tokio::test]
async fn inactive_service_is_rejected() {
    let app = TestApp::new().await;
    let (clinic, service) = app.clinic_with_service(30).await;
    let mut paused: clinic_service::ActiveModel = service.clone().into();
    paused.active = Set(false);
    paused.update(app.db()).await.unwrap();

    let err = app
        .services
        .availability
        .compute_available_slots(clinic.id, service.id, monday(), None)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));
}
