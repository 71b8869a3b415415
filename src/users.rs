use std::fmt::{Display, Formatter};
use std::str::FromStr;
use anyhow::anyhow;
use rocket::serde::json::Json;
use rocket::{Build, Rocket, State};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use crate::auth::user_info;
use crate::datetime::StudioDateTime;
use crate::db::DbPool;
use crate::error::ApiError;
use crate::impl_sqlx_text_type_encode_decode;
use crate::notify::Contact;
use crate::{SharedStudioState, StudioSessionId};

pub type UserId = i64;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Student,
    Instructor,
    Admin,
}
impl_sqlx_text_type_encode_decode!(Role);

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Student => f.write_str("student"),
            Role::Instructor => f.write_str("instructor"),
            Role::Admin => f.write_str("admin"),
        }
    }
}
impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "student" => Ok(Role::Student),
            "instructor" => Ok(Role::Instructor),
            "admin" => Ok(Role::Admin),
            _ => Err(anyhow!("Unknown role: {s}")),
        }
    }
}

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub id: UserId,
    pub email: String,
    pub name: String,
    pub role: Role,
    pub created: StudioDateTime,
}
impl UserRecord {
    pub fn contact(&self) -> Contact {
        Contact { name: self.name.clone(), email: self.email.clone() }
    }
}

/// Finds the user by email or registers a new one; emails listed as admins are promoted on every login.
pub async fn upsert_user(pool: &SqlitePool, email: &str, name: &str, admin_emails: &[String]) -> anyhow::Result<UserRecord> {
    let email = email.trim().to_lowercase();
    let is_admin = admin_emails.iter().any(|e| e.eq_ignore_ascii_case(&email));
    sqlx::query("INSERT INTO users (email, name, role, created) VALUES (?, ?, ?, ?)
                 ON CONFLICT(email) DO NOTHING")
        .bind(&email)
        .bind(name)
        .bind(Role::Student)
        .bind(StudioDateTime::now())
        .execute(pool).await?;
    if is_admin {
        sqlx::query("UPDATE users SET role=? WHERE email=?")
            .bind(Role::Admin)
            .bind(&email)
            .execute(pool).await?;
    }
    let user = sqlx::query_as::<_, UserRecord>("SELECT * FROM users WHERE email=?")
        .bind(&email)
        .fetch_one(pool).await?;
    Ok(user)
}

pub async fn load_user(conn: &mut SqliteConnection, user_id: UserId) -> Result<Option<UserRecord>, sqlx::Error> {
    sqlx::query_as::<_, UserRecord>("SELECT * FROM users WHERE id=?")
        .bind(user_id)
        .fetch_optional(&mut *conn).await
}

#[get("/api/admin/users?<role>")]
async fn get_users(role: Option<&str>, session_id: StudioSessionId, state: &State<SharedStudioState>, db: &State<DbPool>) -> Result<Json<Vec<UserRecord>>, ApiError> {
    user_info(&session_id, state).await?.require_staff()?;
    let users = if let Some(role) = role {
        let role = Role::from_str(role).map_err(|e| ApiError::BadRequest(e.to_string()))?;
        sqlx::query_as::<_, UserRecord>("SELECT * FROM users WHERE role=? ORDER BY name")
            .bind(role)
            .fetch_all(&db.0).await?
    } else {
        sqlx::query_as::<_, UserRecord>("SELECT * FROM users ORDER BY name")
            .fetch_all(&db.0).await?
    };
    Ok(users.into())
}

#[derive(Deserialize, Debug)]
struct RoleChange {
    role: Role,
}
#[post("/api/admin/users/<user_id>/role", data = "<change>")]
async fn post_user_role(user_id: UserId, change: Json<RoleChange>, session_id: StudioSessionId, state: &State<SharedStudioState>, db: &State<DbPool>) -> Result<Json<UserRecord>, ApiError> {
    user_info(&session_id, state).await?.require_admin()?;
    let res = sqlx::query("UPDATE users SET role=? WHERE id=?")
        .bind(change.role)
        .bind(user_id)
        .execute(&db.0).await?;
    if res.rows_affected() == 0 {
        return Err(ApiError::NotFound { what: "User" });
    }
    let mut conn = db.0.acquire().await?;
    let user = load_user(&mut conn, user_id).await?.ok_or(ApiError::NotFound { what: "User" })?;
    // sessions cache the role
    for session in state.write().await.sessions.values_mut() {
        if session.user_info.id == user_id {
            session.user_info.role = user.role;
        }
    }
    Ok(user.into())
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
        get_users,
        post_user_role,
    ])
}

#[test]
fn test_role_text() {
    for role in [Role::Student, Role::Instructor, Role::Admin] {
        assert_eq!(Role::from_str(&role.to_string()).unwrap(), role);
    }
    assert!(Role::from_str("owner").is_err());
}
