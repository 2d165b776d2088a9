// libs/appointment-cell/src/settings.rs
use std::time::Duration;

use shared_config::AppConfig;

use crate::error::AppointmentError;
use crate::services::calendar::ClinicCalendar;

#[derive(Debug, Clone, Copy)]
pub struct SchedulingSettings {
    pub calendar: ClinicCalendar,
    pub age_of_majority: u32,
    /// Default and upper bound for a search's timeout.
    pub search_timeout: Duration,
    pub max_page_size: u32,
}

impl SchedulingSettings {
    pub fn from_config(config: &AppConfig) -> Result<Self, AppointmentError> {
        let calendar =
            ClinicCalendar::from_name(&config.clinic_timezone).map_err(AppointmentError::Validation)?;

        if config.search_max_page_size == 0 {
            return Err(AppointmentError::Validation(
                "SEARCH_MAX_PAGE_SIZE must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            calendar,
            age_of_majority: config.age_of_majority,
            search_timeout: Duration::from_millis(config.search_timeout_ms),
            max_page_size: config.search_max_page_size,
        })
    }
}

impl Default for SchedulingSettings {
    fn default() -> Self {
        Self {
            calendar: ClinicCalendar::default(),
            age_of_majority: 18,
            search_timeout: Duration::from_secs(5),
            max_page_size: 200,
        }
    }
}
