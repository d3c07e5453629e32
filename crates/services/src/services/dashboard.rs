//! Per-user dashboard layout, stored as raw JSON and validated on read.

use std::{collections::HashSet, sync::Arc};

use db::models::user_dashboard::UserDashboard;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum_macros::{Display, EnumString};
use thiserror::Error;
use tracing::{debug, warn};
use ts_rs::TS;
use uuid::Uuid;

use super::{
    database::{Database, DatabaseError, DbAction},
    design_system::QueryCache,
    error_boundary::Component,
    i18n::Translator,
};

const MODEL: &str = "UserDashboard";

#[derive(Debug, Error)]
pub enum DashboardError {
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ChartType {
    Pie,
    Line,
    Bar,
    Number,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct ChartConfig {
    pub id: String,
    pub data_set: String,
    pub title: String,
    #[serde(rename = "type")]
    pub chart_type: ChartType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(type = "Array<Record<string, unknown>> | null")]
    pub filters_value: Option<Vec<Map<String, Value>>>,
}

impl ChartConfig {
    fn pie(id: &str, data_set: &str, title: String) -> Self {
        Self {
            id: id.to_string(),
            data_set: data_set.to_string(),
            title,
            chart_type: ChartType::Pie,
            group_by: None,
            order: None,
            filters_value: None,
        }
    }
}

pub fn default_charts(t: &dyn Translator) -> Vec<ChartConfig> {
    vec![
        ChartConfig::pie("1", "Revenue", t.t("dashboard.revenue")),
        ChartConfig::pie("2", "Appointments", t.t("dashboard.appointments")),
        ChartConfig::pie("3", "Clients", t.t("dashboard.clients")),
    ]
}

/// Stored charts, or the defaults when nothing usable is stored.
pub fn parse_dashboard_config(raw: Option<&str>, t: &dyn Translator) -> Vec<ChartConfig> {
    let Some(raw) = raw else {
        return default_charts(t);
    };
    match serde_json::from_str::<Vec<ChartConfig>>(raw) {
        Ok(charts) => charts,
        Err(e) => {
            warn!(error = %e, "Invalid dashboard configuration, using defaults");
            default_charts(t)
        }
    }
}

/// A layout ready to draw: charts in display order, unordered ones last.
pub struct ChartGrid {
    charts: Vec<ChartConfig>,
}

impl ChartGrid {
    pub fn new(charts: Vec<ChartConfig>) -> Self {
        Self { charts }
    }
}

impl Component for ChartGrid {
    type Output = Vec<ChartConfig>;

    fn name(&self) -> &str {
        "ChartGrid"
    }

    fn render(&self) -> anyhow::Result<Self::Output> {
        let mut seen = HashSet::with_capacity(self.charts.len());
        if let Some(duplicate) = self.charts.iter().find(|c| !seen.insert(c.id.as_str())) {
            anyhow::bail!("duplicate chart id {}", duplicate.id);
        }
        let mut charts = self.charts.clone();
        charts.sort_by_key(|c| c.order.unwrap_or(i32::MAX));
        Ok(charts)
    }
}

fn cache_key(user_id: Uuid) -> String {
    format!("dashboard:{user_id}")
}

/// Layouts are served from the query cache until a soft reload invalidates it.
pub struct DashboardService {
    database: Arc<Database>,
    translator: Arc<dyn Translator>,
    cache: QueryCache,
}

impl DashboardService {
    pub fn new(database: Arc<Database>, translator: Arc<dyn Translator>, cache: QueryCache) -> Self {
        Self {
            database,
            translator,
            cache,
        }
    }

    pub async fn load(&self, user_id: Uuid) -> Result<Vec<ChartConfig>, DashboardError> {
        let key = cache_key(user_id);
        if let Some(cached) = self.cache.get(&key).await {
            match serde_json::from_value(cached) {
                Ok(charts) => return Ok(charts),
                Err(e) => debug!(error = %e, "Discarding unreadable cached dashboard"),
            }
        }

        let stored = self
            .database
            .run(MODEL, DbAction::FindUnique, |pool| async move {
                UserDashboard::find_by_user_id(&pool, user_id).await
            })
            .await?;

        let charts = parse_dashboard_config(
            stored.as_ref().map(|dashboard| dashboard.config.as_str()),
            self.translator.as_ref(),
        );
        self.cache.insert(key, serde_json::to_value(&charts)?).await;
        Ok(charts)
    }

    pub async fn save(
        &self,
        user_id: Uuid,
        charts: Vec<ChartConfig>,
    ) -> Result<Vec<ChartConfig>, DashboardError> {
        let config = serde_json::to_string(&charts)?;
        self.database
            .run(MODEL, DbAction::Upsert, |pool| {
                let config = config.clone();
                async move { UserDashboard::upsert(&pool, user_id, &config).await }
            })
            .await?;
        self.cache
            .insert(cache_key(user_id), serde_json::to_value(&charts)?)
            .await;
        Ok(charts)
    }
}

#[cfg(test)]
mod tests {
    use db::DBService;

    use super::*;
    use crate::services::{
        config::{DatabaseConfig, LoggerConfig},
        i18n::Catalog,
        system_reload::QueryInvalidator,
        test_support::logger_with,
    };

    async fn service() -> (DashboardService, DBService, QueryCache) {
        let (logger, _, _) = logger_with(LoggerConfig::default());
        let db = DBService::new_in_memory().await.unwrap();
        let database = Arc::new(Database::new(db.clone(), DatabaseConfig::default(), logger));
        let cache = QueryCache::default();
        (
            DashboardService::new(database, Arc::new(Catalog::english()), cache.clone()),
            db,
            cache,
        )
    }

    #[test]
    fn missing_or_malformed_config_falls_back_to_defaults() {
        let t = Catalog::english();
        let defaults = default_charts(&t);

        assert_eq!(parse_dashboard_config(None, &t), defaults);
        assert_eq!(parse_dashboard_config(Some("{not json"), &t), defaults);
        assert_eq!(parse_dashboard_config(Some(r#"{"id": "1"}"#), &t), defaults);

        let titles: Vec<_> = defaults.iter().map(|c| c.title.as_str()).collect();
        assert_eq!(
            titles,
            vec!["Revenue Distribution", "Appointments by Service", "Client Distribution"]
        );
        assert!(defaults.iter().all(|c| c.chart_type == ChartType::Pie));
    }

    #[test]
    fn stored_charts_keep_their_fields() {
        let raw = r#"[{"id":"2","dataSet":"MonthlyRevenue","title":"Monthly Revenue","type":"line","groupBy":"date","order":1}]"#;

        let charts = parse_dashboard_config(Some(raw), &Catalog::english());

        assert_eq!(charts.len(), 1);
        assert_eq!(charts[0].chart_type, ChartType::Line);
        assert_eq!(charts[0].group_by.as_deref(), Some("date"));
        assert_eq!(charts[0].order, Some(1));
    }

    #[test]
    fn chart_grid_orders_charts_and_rejects_duplicate_ids() {
        let t = Catalog::english();
        let mut charts = default_charts(&t);
        charts[2].order = Some(0);

        let rendered = ChartGrid::new(charts.clone()).render().unwrap();
        let ids: Vec<_> = rendered.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["3", "1", "2"]);

        charts[1].id = "1".to_string();
        let err = ChartGrid::new(charts).render().unwrap_err();
        assert_eq!(err.to_string(), "duplicate chart id 1");
    }

    #[tokio::test]
    async fn new_user_sees_defaults_until_saving() {
        let (service, _, _) = service().await;
        let user_id = Uuid::new_v4();

        assert_eq!(service.load(user_id).await.unwrap().len(), 3);

        let chart = ChartConfig {
            id: "1".to_string(),
            data_set: "TodayRevenue".to_string(),
            title: "Today's Revenue".to_string(),
            chart_type: ChartType::Number,
            group_by: None,
            order: Some(0),
            filters_value: None,
        };
        service.save(user_id, vec![chart.clone()]).await.unwrap();

        assert_eq!(service.load(user_id).await.unwrap(), vec![chart]);
    }

    #[tokio::test]
    async fn corrupt_row_is_replaced_by_defaults_on_read() {
        let (service, db, _) = service().await;
        let user_id = Uuid::new_v4();
        UserDashboard::upsert(&db.pool(), user_id, "null").await.unwrap();

        let charts = service.load(user_id).await.unwrap();

        assert_eq!(charts, default_charts(&Catalog::english()));
    }

    #[tokio::test]
    async fn cached_layout_is_served_until_queries_are_invalidated() {
        let (service, db, cache) = service().await;
        let user_id = Uuid::new_v4();
        assert_eq!(service.load(user_id).await.unwrap().len(), 3);

        let stored = r#"[{"id":"9","dataSet":"Clients","title":"Clients","type":"bar"}]"#;
        UserDashboard::upsert(&db.pool(), user_id, stored).await.unwrap();
        assert_eq!(service.load(user_id).await.unwrap().len(), 3);

        cache.invalidate_queries().await.unwrap();

        let charts = service.load(user_id).await.unwrap();
        assert_eq!(charts.len(), 1);
        assert_eq!(charts[0].chart_type, ChartType::Bar);
    }
}
