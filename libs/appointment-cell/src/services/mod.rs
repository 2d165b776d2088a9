pub mod audit;
pub mod availability;
pub mod booking;
pub mod calendar;
pub mod conflict;
pub mod consent;
pub mod lifecycle;
pub mod rbac;
