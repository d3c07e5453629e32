pub mod error_log;
pub mod user_dashboard;
