pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod enrollment;
pub mod error;
pub mod identification;
pub mod jobs;
pub mod session;

pub use db::DbPool;

use config::Config;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

use crate::api::rate_limit::RateLimiter;
use crate::auth::AuthService;
use crate::db::TenantTables;
use crate::enrollment::EnrollmentCoordinator;
use crate::identification::IdentificationCoordinator;
use crate::jobs::MatchingJobClient;
use crate::session::SessionCodec;

pub struct AppState {
    pub config: Config,
    pub db: DbPool,
    pub sessions: SessionCodec,
    pub auth: AuthService,
    pub enrollment: EnrollmentCoordinator,
    pub identification: IdentificationCoordinator,
    pub jobs: Arc<dyn MatchingJobClient>,
    pub rate_limiter: Arc<RateLimiter>,
    pub metrics_handle: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(config: Config, db: DbPool, jobs: Arc<dyn MatchingJobClient>) -> Self {
        let tenants = Arc::new(TenantTables::new(db.clone()));
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        Self {
            sessions: SessionCodec::new(&config.session),
            auth: AuthService::new(db.clone(), tenants, config.auth.clone()),
            enrollment: EnrollmentCoordinator::new(db.clone(), jobs.clone()),
            identification: IdentificationCoordinator::new(db.clone(), jobs.clone())
                .with_callbacks(config.jobs.callback_secret.is_some()),
            jobs,
            rate_limiter,
            config,
            db,
            metrics_handle: None,
        }
    }

    /// Set the Prometheus metrics handle
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }
}
