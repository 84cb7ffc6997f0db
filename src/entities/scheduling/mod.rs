pub mod appointment;
pub mod appointment_note;
pub mod clinic;
pub mod clinic_service;
pub mod staff;
pub mod staff_availability;
