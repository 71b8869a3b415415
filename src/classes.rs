use std::fmt::{Display, Formatter};
use std::str::FromStr;
use anyhow::anyhow;
use chrono::{NaiveDate, NaiveTime};
use itertools::Itertools;
use log::info;
use rocket::serde::json::Json;
use rocket::{Build, Rocket, State};
use serde::{Deserialize, Serialize};
use sqlx::query::Query;
use sqlx::sqlite::SqliteArguments;
use sqlx::{FromRow, Sqlite, SqliteConnection};
use studiohttpd_proc_macros::ChangedColumns;
use crate::auth::user_info;
use crate::bookings::cancel_bookings_of_cancelled_class;
use crate::datetime::StudioDateTime;
use crate::db::{retry_on_busy, DbPool, UnitOfWork};
use crate::error::ApiError;
use crate::impl_sqlx_text_type_encode_decode;
use crate::notify::{ClassSlot, Contact, NotificationHub};
use crate::users::{load_user, Role, UserId};
use crate::{AppConfig, SharedStudioState, StudioSessionId};

pub type ClassId = i64;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClassStatus {
    Scheduled,
    Cancelled,
    Completed,
}
impl_sqlx_text_type_encode_decode!(ClassStatus);

impl Display for ClassStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ClassStatus::Scheduled => f.write_str("scheduled"),
            ClassStatus::Cancelled => f.write_str("cancelled"),
            ClassStatus::Completed => f.write_str("completed"),
        }
    }
}
impl FromStr for ClassStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(ClassStatus::Scheduled),
            "cancelled" => Ok(ClassStatus::Cancelled),
            "completed" => Ok(ClassStatus::Completed),
            _ => Err(anyhow!("Unknown class status: {s}")),
        }
    }
}

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ClassTypeRecord {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub duration_minutes: i64,
}

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ClassSession {
    pub id: ClassId,
    pub class_type_id: i64,
    pub instructor_id: Option<UserId>,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub capacity: i64,
    pub status: ClassStatus,
}
impl ClassSession {
    pub fn starts_at(&self, cfg: &AppConfig) -> Result<StudioDateTime, ApiError> {
        StudioDateTime::from_class_slot(self.date, self.start_time, &cfg.studio_offset())
            .ok_or_else(|| anyhow!("Class id: {} has no valid start time", self.id).into())
    }
}

/// Class session with what the schedule shows about it.
#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleEntry {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub session: ClassSession,
    pub class_name: String,
    pub instructor_name: Option<String>,
    pub confirmed_count: i64,
    #[sqlx(skip)]
    pub spots_left: i64,
}

const SCHEDULE_SELECT: &str = "SELECT cs.*, ct.name AS class_name, u.name AS instructor_name,
        (SELECT COUNT(*) FROM bookings b WHERE b.class_session_id=cs.id AND b.status='confirmed') AS confirmed_count
    FROM class_sessions cs
    JOIN class_types ct ON ct.id=cs.class_type_id
    LEFT JOIN users u ON u.id=cs.instructor_id";

fn with_spots_left(mut entry: ScheduleEntry) -> ScheduleEntry {
    entry.spots_left = (entry.session.capacity - entry.confirmed_count).max(0);
    entry
}

pub async fn load_schedule(conn: &mut SqliteConnection, from: NaiveDate) -> Result<Vec<ScheduleEntry>, sqlx::Error> {
    let qs = format!("{SCHEDULE_SELECT} WHERE cs.date>=? ORDER BY cs.date, cs.start_time, cs.id");
    let entries = sqlx::query_as::<_, ScheduleEntry>(&qs)
        .bind(from)
        .fetch_all(&mut *conn).await?;
    Ok(entries.into_iter().map(with_spots_left).collect())
}

pub async fn load_schedule_entry(conn: &mut SqliteConnection, class_id: ClassId) -> Result<Option<ScheduleEntry>, sqlx::Error> {
    let qs = format!("{SCHEDULE_SELECT} WHERE cs.id=?");
    let entry = sqlx::query_as::<_, ScheduleEntry>(&qs)
        .bind(class_id)
        .fetch_optional(&mut *conn).await?;
    Ok(entry.map(with_spots_left))
}

pub async fn load_class(conn: &mut SqliteConnection, class_id: ClassId) -> Result<Option<ClassSession>, sqlx::Error> {
    sqlx::query_as::<_, ClassSession>("SELECT * FROM class_sessions WHERE id=?")
        .bind(class_id)
        .fetch_optional(&mut *conn).await
}

pub async fn confirmed_count(conn: &mut SqliteConnection, class_id: ClassId) -> Result<i64, sqlx::Error> {
    let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM bookings WHERE class_session_id=? AND status='confirmed'")
        .bind(class_id)
        .fetch_one(&mut *conn).await?;
    Ok(count.0)
}

pub async fn has_capacity(conn: &mut SqliteConnection, class: &ClassSession) -> Result<bool, sqlx::Error> {
    Ok(confirmed_count(conn, class.id).await? < class.capacity)
}

/// Flat class description used in notifications.
pub async fn load_class_slot(conn: &mut SqliteConnection, class: &ClassSession) -> Result<ClassSlot, sqlx::Error> {
    let class_type: (String,) = sqlx::query_as("SELECT name FROM class_types WHERE id=?")
        .bind(class.class_type_id)
        .fetch_one(&mut *conn).await?;
    let instructor = match class.instructor_id {
        Some(id) => load_user(conn, id).await?.map(|u| Contact { name: u.name, email: u.email }),
        None => None,
    };
    Ok(ClassSlot {
        class_session_id: class.id,
        class_name: class_type.0,
        date: class.date,
        start_time: class.start_time,
        instructor,
    })
}

#[get("/api/class-types")]
async fn get_class_types(db: &State<DbPool>) -> Result<Json<Vec<ClassTypeRecord>>, ApiError> {
    let types = sqlx::query_as::<_, ClassTypeRecord>("SELECT * FROM class_types ORDER BY name")
        .fetch_all(&db.0).await?;
    Ok(types.into())
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct NewClassType {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_duration")]
    pub duration_minutes: i64,
}
fn default_duration() -> i64 {
    60
}
pub async fn insert_class_type(conn: &mut SqliteConnection, class_type: &NewClassType) -> Result<ClassTypeRecord, ApiError> {
    if class_type.name.trim().is_empty() {
        return Err(ApiError::BadRequest("Class type name must be set".to_string()));
    }
    let rec = sqlx::query_as::<_, ClassTypeRecord>("INSERT INTO class_types (name, description, duration_minutes) VALUES (?, ?, ?)
                 ON CONFLICT(name) DO UPDATE SET description=excluded.description, duration_minutes=excluded.duration_minutes
                 RETURNING *")
        .bind(class_type.name.trim())
        .bind(&class_type.description)
        .bind(class_type.duration_minutes)
        .fetch_one(&mut *conn).await?;
    Ok(rec)
}
#[post("/api/admin/class-types", data = "<class_type>")]
async fn post_class_type(class_type: Json<NewClassType>, session_id: StudioSessionId, state: &State<SharedStudioState>, db: &State<DbPool>) -> Result<Json<ClassTypeRecord>, ApiError> {
    user_info(&session_id, state).await?.require_admin()?;
    let mut conn = db.0.acquire().await?;
    Ok(insert_class_type(&mut conn, &class_type).await?.into())
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct NewClassSession {
    pub class_type_id: i64,
    #[serde(default)]
    pub instructor_id: Option<UserId>,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub capacity: i64,
}

async fn check_instructor(conn: &mut SqliteConnection, instructor_id: UserId) -> Result<(), ApiError> {
    let user = load_user(conn, instructor_id).await?.ok_or(ApiError::NotFound { what: "Instructor" })?;
    if user.role == Role::Student {
        return Err(ApiError::BadRequest(format!("User {} is not an instructor", user.email)));
    }
    Ok(())
}

pub async fn insert_class_session(conn: &mut SqliteConnection, class: &NewClassSession) -> Result<ClassSession, ApiError> {
    if class.capacity < 1 {
        return Err(ApiError::BadRequest("Capacity must be at least 1".to_string()));
    }
    if class.end_time <= class.start_time {
        return Err(ApiError::BadRequest("Class must end after it starts".to_string()));
    }
    let class_type: Option<(i64,)> = sqlx::query_as("SELECT id FROM class_types WHERE id=?")
        .bind(class.class_type_id)
        .fetch_optional(&mut *conn).await?;
    if class_type.is_none() {
        return Err(ApiError::NotFound { what: "Class type" });
    }
    if let Some(instructor_id) = class.instructor_id {
        check_instructor(conn, instructor_id).await?;
    }
    let rec = sqlx::query_as::<_, ClassSession>("INSERT INTO class_sessions
                (class_type_id, instructor_id, date, start_time, end_time, capacity, status)
                VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING *")
        .bind(class.class_type_id)
        .bind(class.instructor_id)
        .bind(class.date)
        .bind(class.start_time)
        .bind(class.end_time)
        .bind(class.capacity)
        .bind(ClassStatus::Scheduled)
        .fetch_one(&mut *conn).await?;
    info!("Class session created, id: {}, date: {} {}", rec.id, rec.date, rec.start_time);
    Ok(rec)
}

#[post("/api/admin/classes", data = "<class>")]
async fn post_class_session(class: Json<NewClassSession>, session_id: StudioSessionId, state: &State<SharedStudioState>, db: &State<DbPool>) -> Result<Json<ClassSession>, ApiError> {
    user_info(&session_id, state).await?.require_admin()?;
    let mut conn = db.0.acquire().await?;
    Ok(insert_class_session(&mut conn, &class).await?.into())
}

/// Admin edit of a class session, only the fields that are set are written.
#[derive(Serialize, Deserialize, ChangedColumns, Default, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ClassSessionChange {
    #[serde(default)]
    pub class_type_id: Option<i64>,
    #[serde(default)]
    pub instructor_id: Option<UserId>,
    #[serde(default)]
    pub date: Option<NaiveDate>,
    #[serde(default)]
    pub start_time: Option<NaiveTime>,
    #[serde(default)]
    pub end_time: Option<NaiveTime>,
    #[serde(default)]
    pub capacity: Option<i64>,
    #[serde(default)]
    pub status: Option<ClassStatus>,
}

fn bind_column<'a>(q: Query<'a, Sqlite, SqliteArguments<'a>>, column: &str, change: &'a ClassSessionChange) -> anyhow::Result<Query<'a, Sqlite, SqliteArguments<'a>>> {
    let q = match column {
        "class_type_id" => q.bind(change.class_type_id),
        "instructor_id" => q.bind(change.instructor_id),
        "date" => q.bind(change.date),
        "start_time" => q.bind(change.start_time),
        "end_time" => q.bind(change.end_time),
        "capacity" => q.bind(change.capacity),
        "status" => q.bind(change.status),
        _ => return Err(anyhow!("Dont know how to bind column {column}")),
    };
    Ok(q)
}

pub async fn update_class_session(uow: &mut UnitOfWork, class_id: ClassId, change: &ClassSessionChange) -> Result<ClassSession, ApiError> {
    let class = load_class(uow.conn(), class_id).await?.ok_or(ApiError::ClassNotFound)?;
    if change.is_empty_change() {
        return Ok(class);
    }
    if change.status == Some(ClassStatus::Cancelled) {
        return Err(ApiError::BadRequest("Use the cancel action to cancel a class".to_string()));
    }
    if let Some(capacity) = change.capacity {
        if capacity < 1 {
            return Err(ApiError::BadRequest("Capacity must be at least 1".to_string()));
        }
        let confirmed = confirmed_count(uow.conn(), class_id).await?;
        if capacity < confirmed {
            return Err(ApiError::CapacityBelowBookings { capacity, confirmed });
        }
    }
    let start_time = change.start_time.unwrap_or(class.start_time);
    let end_time = change.end_time.unwrap_or(class.end_time);
    if end_time <= start_time {
        return Err(ApiError::BadRequest("Class must end after it starts".to_string()));
    }
    if let Some(instructor_id) = change.instructor_id {
        check_instructor(uow.conn(), instructor_id).await?;
    }
    let columns = change.changed_columns();
    let placeholders = columns.iter().map(|column| format!("{column}=?")).join(", ");
    let qs = format!("UPDATE class_sessions SET {placeholders} WHERE id=?");
    let mut q = sqlx::query(&qs);
    for column in &columns {
        q = bind_column(q, column, change)?;
    }
    q.bind(class_id).execute(&mut *uow.conn()).await?;
    info!("Class session id: {class_id} updated, columns: {columns:?}");
    load_class(uow.conn(), class_id).await?.ok_or(ApiError::ClassNotFound)
}

#[post("/api/admin/classes/<class_id>", data = "<change>")]
async fn post_class_session_change(class_id: ClassId, change: Json<ClassSessionChange>, session_id: StudioSessionId, state: &State<SharedStudioState>, db: &State<DbPool>) -> Result<Json<ClassSession>, ApiError> {
    user_info(&session_id, state).await?.require_admin()?;
    let change = &change.into_inner();
    let class = retry_on_busy(|| async move {
        let mut uow = UnitOfWork::begin(&db.0).await?;
        let class = update_class_session(&mut uow, class_id, change).await?;
        uow.commit().await?;
        Ok(class)
    }).await?;
    Ok(class.into())
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ClassCancellation {
    pub class: ClassSession,
    pub bookings_cancelled: usize,
    pub credits_refunded: i64,
}
#[post("/api/admin/classes/<class_id>/cancel")]
async fn post_cancel_class_session(class_id: ClassId, session_id: StudioSessionId, state: &State<SharedStudioState>, db: &State<DbPool>, cfg: &State<AppConfig>, hub: &State<NotificationHub>) -> Result<Json<ClassCancellation>, ApiError> {
    let user = user_info(&session_id, state).await?.require_admin()?;
    let now = StudioDateTime::now();
    let (res, notifications) = retry_on_busy(|| async move {
        let mut uow = UnitOfWork::begin(&db.0).await?;
        let class = load_class(uow.conn(), class_id).await?.ok_or(ApiError::ClassNotFound)?;
        if class.status == ClassStatus::Cancelled {
            return Err(ApiError::ClassNotBookable);
        }
        sqlx::query("UPDATE class_sessions SET status=? WHERE id=?")
            .bind(ClassStatus::Cancelled)
            .bind(class_id)
            .execute(&mut *uow.conn()).await?;
        let (bookings_cancelled, credits_refunded) = cancel_bookings_of_cancelled_class(&mut uow, &class, cfg, &now).await?;
        let class = load_class(uow.conn(), class_id).await?.ok_or(ApiError::ClassNotFound)?;
        let notifications = uow.commit().await?;
        Ok((ClassCancellation { class, bookings_cancelled, credits_refunded }, notifications))
    }).await?;
    info!("Class id: {class_id} cancelled by: {}, bookings cancelled: {}", user.email, res.bookings_cancelled);
    hub.publish(notifications);
    Ok(res.into())
}

#[get("/api/classes?<from>")]
async fn get_classes(from: Option<&str>, db: &State<DbPool>, cfg: &State<AppConfig>) -> Result<Json<Vec<ScheduleEntry>>, ApiError> {
    let from = match from {
        Some(s) => NaiveDate::from_str(s).map_err(|e| ApiError::BadRequest(format!("Invalid date {s}: {e}")))?,
        None => cfg.studio_today(),
    };
    let mut conn = db.0.acquire().await?;
    Ok(load_schedule(&mut conn, from).await?.into())
}

#[get("/api/classes/<class_id>")]
async fn get_class(class_id: ClassId, db: &State<DbPool>) -> Result<Json<ScheduleEntry>, ApiError> {
    let mut conn = db.0.acquire().await?;
    let entry = load_schedule_entry(&mut conn, class_id).await?.ok_or(ApiError::ClassNotFound)?;
    Ok(entry.into())
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
        get_class_types,
        post_class_type,
        post_class_session,
        post_class_session_change,
        post_cancel_class_session,
        get_classes,
        get_class,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn changed_columns_follow_declaration_order() {
        let change = ClassSessionChange {
            capacity: Some(12),
            date: NaiveDate::from_ymd_opt(2026, 3, 5),
            ..Default::default()
        };
        assert_eq!(change.changed_columns(), vec!["date", "capacity"]);
        assert!(!change.is_empty_change());
        assert!(ClassSessionChange::default().is_empty_change());
    }

    #[test]
    fn class_status_text() {
        for status in [ClassStatus::Scheduled, ClassStatus::Cancelled, ClassStatus::Completed] {
            assert_eq!(ClassStatus::from_str(&status.to_string()).unwrap(), status);
        }
    }

    #[test]
    fn class_start_uses_studio_offset() {
        let cfg = AppConfig { utc_offset_minutes: 120, ..Default::default() };
        let class = ClassSession {
            id: 1,
            class_type_id: 1,
            instructor_id: None,
            date: NaiveDate::from_ymd_opt(2026, 6, 1).unwrap(),
            start_time: NaiveTime::from_hms_opt(7, 30, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(8, 30, 0).unwrap(),
            capacity: 10,
            status: ClassStatus::Scheduled,
        };
        assert_eq!(class.starts_at(&cfg).unwrap().to_iso_string(), "2026-06-01T07:30:00+02:00");
    }
}
