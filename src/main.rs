#[macro_use] extern crate rocket;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use anyhow::anyhow;
use chrono::{FixedOffset, NaiveDate, Offset, Utc};
use log::{error, info, warn};
use rocket::fairing::AdHoc;
use rocket::figment::Figment;
use rocket::fs::FileServer;
use rocket::http::{CookieJar, Status};
use rocket::{request, Build, Request, Rocket, State};
use rocket::tokio::sync::RwLock;
use rocket_dyn_templates::{Template, context, handlebars};
use rocket_dyn_templates::handlebars::{Handlebars, Helper};
use serde::Deserialize;
use crate::auth::{user_info, UserInfo, STUDIO_SESSION_ID};
use crate::classes::load_schedule;
use crate::credits::available_credits;
use crate::datetime::{dtstr, hhmm, StudioDateTime};
use crate::db::{DbPool, DbPoolFairing};
use crate::error::ApiError;
use crate::notify::{run_dispatcher, HttpMailer, LogMailer, Mailer, NotificationHub, RetryPolicy};
use crate::ratelimit::{RateLimitConfig, RateLimiter};

#[cfg(test)]
mod tests;
mod db;
mod auth;
mod bookings;
mod classes;
mod credits;
mod datetime;
mod demo;
mod error;
mod notify;
mod packages;
mod policy;
mod ratelimit;
mod users;
mod util;
mod waitlist;

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct MailConfig {
    /// JSON endpoint of the email provider, mails are only logged when unset
    pub api_url: Option<String>,
    pub api_key: String,
    pub from: String,
}

/// `[default.studio]` table of Rocket.toml.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct AppConfig {
    pub utc_offset_minutes: i32,
    pub admin_emails: Vec<String>,
    pub dev_login: bool,
    pub free_class_dates: Vec<NaiveDate>,
    pub cancellation_window_hours: i64,
    pub late_cancel_penalty: String,
    pub no_show_penalty: String,
    pub cancel_rate_limit: RateLimitConfig,
    pub mail: MailConfig,
    pub notification_attempts: u32,
    pub notification_backoff_secs: u64,
}
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            utc_offset_minutes: 0,
            admin_emails: vec![],
            dev_login: false,
            free_class_dates: vec![],
            cancellation_window_hours: 24,
            late_cancel_penalty: "Credit forfeited".to_string(),
            no_show_penalty: "Credit forfeited".to_string(),
            cancel_rate_limit: RateLimitConfig::default(),
            mail: MailConfig::default(),
            notification_attempts: 3,
            notification_backoff_secs: 2,
        }
    }
}
impl AppConfig {
    pub fn studio_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes * 60).unwrap_or_else(|| Utc.fix())
    }
    pub fn studio_today(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.studio_offset()).date_naive()
    }
    pub fn is_free_day(&self, date: NaiveDate) -> bool {
        self.free_class_dates.contains(&date)
    }
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.notification_attempts.max(1),
            backoff: Duration::from_secs(self.notification_backoff_secs),
        }
    }
    fn mailer(&self) -> anyhow::Result<Arc<dyn Mailer>> {
        match &self.mail.api_url {
            Some(url) => Ok(Arc::new(HttpMailer::new(url, &self.mail.api_key, &self.mail.from)?)),
            None => Ok(Arc::new(LogMailer)),
        }
    }
}

pub struct StudioSession {
    pub user_info: UserInfo,
}
#[derive(Eq, Hash, PartialEq, Debug, Clone)]
pub struct StudioSessionId(pub String);
#[rocket::async_trait]
impl<'r> request::FromRequest<'r> for StudioSessionId {
    type Error = ();
    async fn from_request(request: &'r Request<'_>) -> request::Outcome<StudioSessionId, ()> {
        if let request::Outcome::Success(cookies) = request.guard::<&CookieJar<'_>>().await {
            if let Some(cookie) = cookies.get_private(STUDIO_SESSION_ID) {
                return request::Outcome::Success(StudioSessionId(cookie.value().to_string()));
            }
        }
        request::Outcome::Forward(Status::Unauthorized)
    }
}
#[derive(Default)]
pub struct StudioState {
    pub sessions: HashMap<StudioSessionId, StudioSession>,
}
pub type SharedStudioState = RwLock<StudioState>;

async fn index_impl(user: Option<UserInfo>, db: &State<DbPool>, cfg: &State<AppConfig>) -> Result<Template, ApiError> {
    let mut conn = db.0.acquire().await?;
    let classes = load_schedule(&mut conn, cfg.studio_today()).await?;
    let credits = match &user {
        Some(user) => Some(available_credits(&mut conn, user.id, &StudioDateTime::now()).await?),
        None => None,
    };
    let is_admin = user.as_ref().map(|u| u.is_admin()).unwrap_or(false);
    Ok(Template::render("index", context! {
        user,
        is_admin,
        credits,
        classes,
        dev_login: cfg.dev_login,
    }))
}
#[get("/", rank = 2)]
async fn index_anonymous(db: &State<DbPool>, cfg: &State<AppConfig>) -> Result<Template, ApiError> {
    index_impl(None, db, cfg).await
}
#[get("/")]
async fn index_authorized(session_id: StudioSessionId, state: &State<SharedStudioState>, db: &State<DbPool>, cfg: &State<AppConfig>) -> Result<Template, ApiError> {
    // stale cookie of a session lost on restart
    let user = user_info(&session_id, state).await.ok();
    index_impl(user, db, cfg).await
}

#[catch(400)]
fn bad_request() -> ApiError {
    ApiError::BadRequest("Bad request".to_string())
}
#[catch(401)]
fn unauthorized() -> ApiError {
    ApiError::Unauthorized
}
#[catch(404)]
fn not_found() -> ApiError {
    ApiError::NotFound { what: "Resource" }
}
#[catch(422)]
fn unprocessable_entity() -> ApiError {
    ApiError::MalformedBody
}
#[catch(500)]
fn internal_error() -> ApiError {
    ApiError::Internal(anyhow!("Internal server error"))
}

fn studio_config(figment: &Figment) -> AppConfig {
    if figment.find_value("studio").is_err() {
        info!("No studio configuration found, using defaults");
        return AppConfig::default();
    }
    match figment.extract_inner::<AppConfig>("studio") {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Invalid studio configuration: {e}, using defaults");
            AppConfig::default()
        }
    }
}

fn build_rocket(figment: Figment) -> Rocket<Build> {
    let cfg = studio_config(&figment);
    let rocket = rocket::custom(figment)
        .attach(Template::custom(|engines| {
            let handlebars = &mut engines.handlebars;
            handlebars.register_helper("stringify",
                                       Box::new(|h: &Helper, _r: &Handlebars, _: &handlebars::Context, _rc: &mut handlebars::RenderContext, out: &mut dyn handlebars::Output| -> handlebars::HelperResult {
                                           let param = h.param(0).ok_or(handlebars::RenderErrorReason::ParamNotFoundForIndex("stringify", 0))?;
                                           let json = serde_json::to_string(param.value()).unwrap_or_else(|_| "Invalid JSON".to_string());
                                           out.write(json.as_ref())?;
                                           Ok(())
                                       }));
            handlebars.register_helper("dtstr",
                                       Box::new(|h: &Helper, _r: &Handlebars, _: &handlebars::Context, _rc: &mut handlebars::RenderContext, out: &mut dyn handlebars::Output| -> handlebars::HelperResult {
                                           let val = h.param(0).ok_or(handlebars::RenderErrorReason::ParamNotFoundForIndex("dtstr", 0))?.value();
                                           out.write(&dtstr(val.as_str()))?;
                                           Ok(())
                                       }));
            handlebars.register_helper("hhmm",
                                       Box::new(|h: &Helper, _r: &Handlebars, _: &handlebars::Context, _rc: &mut handlebars::RenderContext, out: &mut dyn handlebars::Output| -> handlebars::HelperResult {
                                           let val = h.param(0).ok_or(handlebars::RenderErrorReason::ParamNotFoundForIndex("hhmm", 0))?.value();
                                           out.write(&hhmm(val.as_str()))?;
                                           Ok(())
                                       }));
        }))
        .attach(DbPoolFairing())
        .attach(AdHoc::on_liftoff("Notification dispatcher", |rocket| Box::pin(async move {
            let (Some(hub), Some(cfg)) = (rocket.state::<NotificationHub>(), rocket.state::<AppConfig>()) else {
                error!("Notification hub not managed, dispatcher not started");
                return;
            };
            let mailer = match cfg.mailer() {
                Ok(mailer) => mailer,
                Err(e) => {
                    warn!("Mail provider client error: {e}, mails will be logged only");
                    Arc::new(LogMailer)
                }
            };
            rocket::tokio::spawn(run_dispatcher(hub.subscribe(), mailer, cfg.retry_policy()));
        })))
        .mount("/", FileServer::from("./static"))
        .mount("/", routes![
            index_anonymous,
            index_authorized,
        ])
        .register("/", catchers![
            bad_request,
            unauthorized,
            not_found,
            unprocessable_entity,
            internal_error,
        ]);
    let rocket = auth::extend(rocket, &cfg);
    let rocket = users::extend(rocket);
    let rocket = classes::extend(rocket);
    let rocket = bookings::extend(rocket);
    let rocket = waitlist::extend(rocket);
    let rocket = credits::extend(rocket);
    let rocket = packages::extend(rocket);
    let rocket = policy::extend(rocket);
    let rocket = notify::extend(rocket);
    let rocket = demo::extend(rocket);

    rocket
        .manage(cfg)
        .manage(NotificationHub::new(256))
        .manage(RateLimiter::default())
        .manage(SharedStudioState::new(StudioState::default()))
}

#[launch]
fn rocket() -> _ {
    build_rocket(rocket::Config::figment())
}
