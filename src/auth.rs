use anyhow::{anyhow, Context};
use log::{debug, info};
use reqwest::header::AUTHORIZATION;
use rocket::{get, routes, Build, Rocket, State};
use rocket::http::{Cookie, CookieJar, SameSite};
use rocket::response::{Debug, Redirect};
use rocket_oauth2::{OAuth2, TokenResponse};
use serde::Serialize;
use serde_json::Value;
use crate::db::DbPool;
use crate::error::ApiError;
use crate::notify::Contact;
use crate::users::{upsert_user, Role, UserId};
use crate::util::generate_random_string;
use crate::{AppConfig, SharedStudioState, StudioSession, StudioSessionId};

/// Authenticated identity, passed explicitly to every operation acting on behalf of a user.
#[derive(Clone, Serialize, Debug)]
pub struct UserInfo {
    pub id: UserId,
    pub name: String,
    pub email: String,
    pub role: Role,
}
impl UserInfo {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
    pub fn contact(&self) -> Contact {
        Contact { name: self.name.clone(), email: self.email.clone() }
    }
    pub fn require_admin(self) -> Result<Self, ApiError> {
        if self.is_admin() {
            Ok(self)
        } else {
            Err(ApiError::Forbidden("Admin role required".to_string()))
        }
    }
    pub fn require_staff(self) -> Result<Self, ApiError> {
        match self.role {
            Role::Admin | Role::Instructor => Ok(self),
            Role::Student => Err(ApiError::Forbidden("Instructor or admin role required".to_string())),
        }
    }
}

pub const STUDIO_SESSION_ID: &str = "studio_session_id";

/// User information to be retrieved from the Google People API.
#[derive(serde::Deserialize)]
struct GoogleUserInfo {
    name: Value,
    email: Value,
}
impl GoogleUserInfo {
    fn name_and_email(&self) -> anyhow::Result<(String, String)> {
        fn to_string(val: &Value) -> String {
            val.as_str().map(|s| s.to_string()).unwrap_or_default()
        }
        let email = to_string(&self.email);
        if email.is_empty() {
            return Err(anyhow!("User email must be set"));
        };
        Ok((to_string(&self.name), email))
    }
}

pub async fn user_info(session_id: &StudioSessionId, state: &State<SharedStudioState>) -> Result<UserInfo, ApiError> {
    state.read().await
        .sessions.get(session_id).map(|s| s.user_info.clone()).ok_or(ApiError::Unauthorized)
}

async fn start_session(name: &str, email: &str, cookies: &CookieJar<'_>, state: &State<SharedStudioState>, db: &State<DbPool>, cfg: &State<AppConfig>) -> anyhow::Result<()> {
    let user = upsert_user(&db.0, email, name, &cfg.admin_emails).await?;
    let user_info = UserInfo {
        id: user.id,
        name: user.name,
        email: user.email,
        role: user.role,
    };
    let session_id = generate_random_string(32);
    info!("User log in, name: {}, email: {}, role: {}", user_info.name, user_info.email, user_info.role);
    state.write().await.sessions.insert(StudioSessionId(session_id.clone()), StudioSession { user_info });
    cookies.add_private(
        Cookie::build((STUDIO_SESSION_ID, session_id))
            .same_site(SameSite::Lax)
            .build()
    );
    Ok(())
}

#[get("/login")]
fn login() -> Redirect {
    Redirect::to("/login/google")
}

#[get("/login/google")]
fn google_login(oauth2: OAuth2<GoogleUserInfo>, cookies: &CookieJar<'_>) -> Result<Redirect, Debug<rocket_oauth2::Error>> {
    Ok(oauth2.get_redirect(cookies, &["profile", "email"])?)
}

#[get("/auth/google")]
async fn google_auth(token: TokenResponse<GoogleUserInfo>, cookies: &CookieJar<'_>, state: &State<SharedStudioState>, db: &State<DbPool>, cfg: &State<AppConfig>) -> Result<Redirect, Debug<anyhow::Error>> {
    // Use the token to retrieve the user's Google account information.
    let rq = reqwest::Client::builder()
        .build()
        .context("failed to build reqwest client")?
        .get("https://www.googleapis.com/oauth2/v2/userinfo")
        .header(AUTHORIZATION, format!("Bearer {}", token.access_token()));
    debug!("Requesting user info: {:?}", rq);
    let response = rq.send()
        .await
        .context("failed to complete request")?;
    let google_user_info: GoogleUserInfo = response
        .json()
        .await
        .context("failed to deserialize response")?;
    let (name, email) = google_user_info.name_and_email()?;
    start_session(&name, &email, cookies, state, db, cfg).await?;
    Ok(Redirect::to("/"))
}

/// Password-less login for local development and tests, mounted only with `dev_login` set.
#[get("/login/dev?<email>&<name>")]
async fn dev_login(email: &str, name: Option<&str>, cookies: &CookieJar<'_>, state: &State<SharedStudioState>, db: &State<DbPool>, cfg: &State<AppConfig>) -> Result<Redirect, Debug<anyhow::Error>> {
    let name = name.unwrap_or_else(|| email.split('@').next().unwrap_or(email));
    start_session(name, email, cookies, state, db, cfg).await?;
    Ok(Redirect::to("/"))
}

#[get("/logout")]
async fn logout(session_id: StudioSessionId, cookies: &CookieJar<'_>, state: &State<SharedStudioState>) -> Redirect {
    state.write().await.sessions.remove(&session_id);
    cookies.remove_private(STUDIO_SESSION_ID);
    Redirect::to("/")
}

#[get("/api/me")]
async fn get_me(session_id: StudioSessionId, state: &State<SharedStudioState>) -> Result<rocket::serde::json::Json<UserInfo>, ApiError> {
    Ok(user_info(&session_id, state).await?.into())
}

pub fn extend(rocket: Rocket<Build>, cfg: &AppConfig) -> Rocket<Build> {
    let rocket = rocket.mount("/", routes![
            login,
            logout,
            get_me,
        ]);
    let rocket = if rocket.figment().find_value("oauth.google").is_ok() {
        rocket.mount("/", routes![google_login, google_auth])
            .attach(OAuth2::<GoogleUserInfo>::fairing("google"))
    } else {
        info!("Google login not configured");
        rocket
    };
    if cfg.dev_login {
        rocket.mount("/", routes![dev_login])
    } else {
        rocket
    }
}
