pub mod appointments;
pub mod availability;

pub use appointments::{AppointmentService, BookAppointmentRequest};
pub use availability::{AvailabilityCalculator, AvailableSlot};
