pub mod calendar;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod lifecycle;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod service;
pub mod store;
pub mod wal;

pub use catalog::FacilityCatalog;
pub use config::Config;
pub use engine::BookingError;
pub use service::{BookingService, PaymentUpdate};
