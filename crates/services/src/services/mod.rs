pub mod app_shell;
pub mod config;
pub mod crash_reporter;
pub mod dashboard;
pub mod database;
pub mod design_system;
pub mod error_boundary;
pub mod error_logger;
pub mod i18n;
pub mod notification;
pub mod scheduler;
pub mod system_reload;

#[cfg(test)]
mod test_support;
