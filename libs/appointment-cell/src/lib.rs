pub mod error;
pub mod extract;
pub mod handlers;
pub mod models;
pub mod router;
pub mod services;
pub mod settings;
pub mod store;

pub use error::AppointmentError;
pub use services::booking::SchedulingService;
pub use settings::SchedulingSettings;
