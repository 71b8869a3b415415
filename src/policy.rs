use log::info;
use rocket::serde::json::Json;
use rocket::{Build, Rocket, State};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqliteConnection};
use crate::auth::user_info;
use crate::bookings::CancellationType;
use crate::db::DbPool;
use crate::error::ApiError;
use crate::{AppConfig, SharedStudioState, StudioSessionId};

/// Studio wide cancellation rules.
#[derive(Serialize, Deserialize, FromRow, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CancellationPolicy {
    pub cancellation_window_hours: i64,
    pub late_cancel_penalty: String,
    pub no_show_penalty: String,
}
impl CancellationPolicy {
    pub fn penalty(&self, cancellation_type: CancellationType) -> &str {
        match cancellation_type {
            CancellationType::OnTime => "None",
            CancellationType::Late => &self.late_cancel_penalty,
            CancellationType::NoShow => &self.no_show_penalty,
        }
    }
}
impl From<&AppConfig> for CancellationPolicy {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            cancellation_window_hours: cfg.cancellation_window_hours,
            late_cancel_penalty: cfg.late_cancel_penalty.clone(),
            no_show_penalty: cfg.no_show_penalty.clone(),
        }
    }
}

/// Stored policy, or the configured defaults when the studio never saved one.
pub async fn load_policy(conn: &mut SqliteConnection, cfg: &AppConfig) -> Result<CancellationPolicy, sqlx::Error> {
    let policy = sqlx::query_as::<_, CancellationPolicy>("SELECT cancellation_window_hours, late_cancel_penalty, no_show_penalty FROM studio_settings WHERE id=1")
        .fetch_optional(&mut *conn).await?;
    Ok(policy.unwrap_or_else(|| cfg.into()))
}

async fn save_policy(conn: &mut SqliteConnection, policy: &CancellationPolicy) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO studio_settings (id, cancellation_window_hours, late_cancel_penalty, no_show_penalty)
                 VALUES (1, ?, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET
                    cancellation_window_hours=excluded.cancellation_window_hours,
                    late_cancel_penalty=excluded.late_cancel_penalty,
                    no_show_penalty=excluded.no_show_penalty")
        .bind(policy.cancellation_window_hours)
        .bind(&policy.late_cancel_penalty)
        .bind(&policy.no_show_penalty)
        .execute(&mut *conn).await?;
    Ok(())
}

#[get("/api/policy")]
async fn get_policy(db: &State<DbPool>, cfg: &State<AppConfig>) -> Result<Json<CancellationPolicy>, ApiError> {
    let mut conn = db.0.acquire().await?;
    Ok(load_policy(&mut conn, cfg).await?.into())
}

#[post("/api/admin/policy", data = "<policy>")]
async fn post_policy(policy: Json<CancellationPolicy>, session_id: StudioSessionId, state: &State<SharedStudioState>, db: &State<DbPool>) -> Result<Json<CancellationPolicy>, ApiError> {
    user_info(&session_id, state).await?.require_admin()?;
    let policy = policy.into_inner();
    if policy.cancellation_window_hours < 0 {
        return Err(ApiError::BadRequest("Cancellation window must not be negative".to_string()));
    }
    let mut conn = db.0.acquire().await?;
    save_policy(&mut conn, &policy).await?;
    info!("Cancellation policy updated: {policy:?}");
    Ok(policy.into())
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
        get_policy,
        post_policy,
    ])
}
