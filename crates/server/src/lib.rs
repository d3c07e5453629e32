use std::sync::Arc;

use db::DBService;
use services::services::{
    app_shell::AppShell,
    config::ResilienceConfig,
    crash_reporter::SentryCrashReporter,
    dashboard::DashboardService,
    database::Database,
    design_system::{DesignSystemContext, QueryCache},
    error_boundary::BoundaryServices,
    error_logger::ErrorLogger,
    i18n::{Catalog, Translator},
    notification::NotificationService,
    system_reload::{ReloadServices, SystemReloader},
};
use tokio::task::JoinHandle;

pub mod error;
pub mod routes;

/// Everything a request handler can reach
#[derive(Clone)]
pub struct AppState {
    logger: Arc<ErrorLogger>,
    database: Arc<Database>,
    shell: Arc<AppShell>,
    dashboard: Arc<DashboardService>,
    boundary: BoundaryServices,
}

impl AppState {
    /// Wire the resilience services over `db` and mount the application shell.
    /// The shell's registrations are torn down when the last state clone drops.
    /// Returns the database event pump, whose lifetime the caller decides.
    pub fn build(db: DBService, config: ResilienceConfig) -> (Self, JoinHandle<()>) {
        let notifications = NotificationService::default();
        let translator: Arc<dyn Translator> = Arc::new(Catalog::english());
        let cache = QueryCache::default();

        let logger = ErrorLogger::start(
            Arc::new(db.clone()),
            Arc::new(notifications.clone()),
            translator.clone(),
            config.logger.clone(),
        );
        let (database, db_events) = Database::start(db, config.database.clone(), logger.clone());

        let reloader = Arc::new(SystemReloader::new(
            ReloadServices {
                design_system: Arc::new(DesignSystemContext::default()),
                invalidator: Arc::new(cache.clone()),
                logger: logger.clone(),
                notifier: Arc::new(notifications.clone()),
                translator: translator.clone(),
            },
            config.reload.clone(),
        ));
        let shell = AppShell::mount(reloader, logger.clone(), Arc::new(notifications.clone()));

        let boundary = BoundaryServices {
            notifier: Arc::new(notifications),
            translator: translator.clone(),
            crash_reporter: Arc::new(SentryCrashReporter),
            logger: Some(logger.clone()),
            development: config.is_development(),
            config: config.boundary,
        };

        let dashboard = Arc::new(DashboardService::new(database.clone(), translator, cache));

        let state = Self {
            logger,
            database,
            shell: Arc::new(shell),
            dashboard,
            boundary,
        };
        (state, db_events)
    }

    pub fn logger(&self) -> &Arc<ErrorLogger> {
        &self.logger
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.database
    }

    pub fn shell(&self) -> &AppShell {
        &self.shell
    }

    pub fn dashboard(&self) -> &DashboardService {
        &self.dashboard
    }

    /// Collaborators for boundaries rendered while serving a request
    pub fn boundary_services(&self) -> BoundaryServices {
        self.boundary.clone()
    }
}
