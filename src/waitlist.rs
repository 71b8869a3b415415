use chrono::{NaiveDate, NaiveTime};
use log::info;
use rocket::serde::json::Json;
use rocket::{Build, Rocket, State};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use crate::auth::{user_info, UserInfo};
use crate::bookings::{find_confirmed_booking, parse_class_id};
use crate::classes::{confirmed_count, has_capacity, load_class, load_class_slot, ClassId, ClassStatus};
use crate::datetime::StudioDateTime;
use crate::db::{retry_on_busy, DbPool, UnitOfWork};
use crate::error::ApiError;
use crate::notify::{Notification, NotificationHub, WaitlistNotice};
use crate::users::{load_user, UserId};
use crate::{SharedStudioState, StudioSessionId};

/// Students notified per freed seat pass.
const NOTIFY_BATCH: i64 = 5;

#[derive(Serialize, Deserialize, FromRow, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WaitlistEntry {
    pub id: i64,
    pub class_session_id: ClassId,
    pub student_id: UserId,
    pub position: i64,
    pub joined_at: StudioDateTime,
    pub notified: bool,
}

async fn find_entry(conn: &mut SqliteConnection, class_id: ClassId, student_id: UserId) -> Result<Option<WaitlistEntry>, sqlx::Error> {
    sqlx::query_as::<_, WaitlistEntry>("SELECT * FROM waitlist WHERE class_session_id=? AND student_id=?")
        .bind(class_id)
        .bind(student_id)
        .fetch_optional(&mut *conn).await
}

/// Puts `student` at the end of the waitlist of a full class.
pub async fn join(uow: &mut UnitOfWork, student: &UserInfo, class_id: ClassId, now: &StudioDateTime) -> Result<WaitlistEntry, ApiError> {
    let class = load_class(uow.conn(), class_id).await?.ok_or(ApiError::ClassNotFound)?;
    if class.status != ClassStatus::Scheduled {
        return Err(ApiError::ClassNotBookable);
    }
    if find_confirmed_booking(uow.conn(), class_id, student.id).await?.is_some() {
        return Err(ApiError::DuplicateBooking);
    }
    if find_entry(uow.conn(), class_id, student.id).await?.is_some() {
        return Err(ApiError::AlreadyOnWaitlist);
    }
    if has_capacity(uow.conn(), &class).await? {
        return Err(ApiError::ClassNotFull);
    }
    let last: (i64,) = sqlx::query_as("SELECT COALESCE(MAX(position), 0) FROM waitlist WHERE class_session_id=?")
        .bind(class_id)
        .fetch_one(&mut *uow.conn()).await?;
    let entry = sqlx::query_as::<_, WaitlistEntry>("INSERT INTO waitlist (class_session_id, student_id, position, joined_at, notified)
                VALUES (?, ?, ?, ?, 0) RETURNING *")
        .bind(class_id)
        .bind(student.id)
        .bind(last.0 + 1)
        .bind(now)
        .fetch_one(&mut *uow.conn()).await
        .map_err(|e| match e.as_database_error() {
            Some(db_err) if db_err.is_unique_violation() => ApiError::AlreadyOnWaitlist,
            _ => e.into(),
        })?;
    info!("Student: {} joined waitlist of class id: {class_id}, position: {}", student.email, entry.position);
    Ok(entry)
}

/// Marks the first waiting students notified and queues a seat open notice for each of them.
/// Returns the number of students notified.
pub async fn notify_waiting(uow: &mut UnitOfWork, class_id: ClassId) -> Result<usize, ApiError> {
    let class = load_class(uow.conn(), class_id).await?.ok_or(ApiError::ClassNotFound)?;
    if class.status != ClassStatus::Scheduled {
        return Ok(0);
    }
    let spots_available = class.capacity - confirmed_count(uow.conn(), class_id).await?;
    if spots_available <= 0 {
        return Ok(0);
    }
    let entries = sqlx::query_as::<_, WaitlistEntry>("SELECT * FROM waitlist w
            WHERE w.class_session_id=? AND w.notified=0
                AND w.student_id NOT IN (SELECT b.student_id FROM bookings b WHERE b.class_session_id=w.class_session_id AND b.status='confirmed')
            ORDER BY w.position
            LIMIT ?")
        .bind(class_id)
        .bind(NOTIFY_BATCH)
        .fetch_all(&mut *uow.conn()).await?;
    if entries.is_empty() {
        return Ok(0);
    }
    let class_slot = load_class_slot(uow.conn(), &class).await?;
    for entry in &entries {
        sqlx::query("UPDATE waitlist SET notified=1 WHERE id=?")
            .bind(entry.id)
            .execute(&mut *uow.conn()).await?;
        let student = load_user(uow.conn(), entry.student_id).await?.ok_or(ApiError::NotFound { what: "Student" })?;
        uow.notify(Notification::WaitlistSeatOpen(WaitlistNotice {
            student: student.contact(),
            class: class_slot.clone(),
            position: entry.position,
            spots_available,
        }));
    }
    info!("Class id: {class_id}, {spots_available} spot(s) open, {} waiting student(s) notified", entries.len());
    Ok(entries.len())
}

/// Runs the waitlist notification pass for a class in its own unit of work.
pub async fn notify_on_seat_freed(pool: &SqlitePool, class_id: ClassId, hub: &NotificationHub) -> Result<usize, ApiError> {
    let (count, notifications) = retry_on_busy(|| async move {
        let mut uow = UnitOfWork::begin(pool).await?;
        let count = notify_waiting(&mut uow, class_id).await?;
        Ok((count, uow.commit().await?))
    }).await?;
    hub.publish(notifications);
    Ok(count)
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct WaitlistRequest {
    #[serde(default)]
    class_id: Option<Value>,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct WaitlistPosition {
    pub position: i64,
}

#[post("/api/waitlist", data = "<request>")]
async fn post_waitlist(request: Json<WaitlistRequest>, session_id: StudioSessionId, state: &State<SharedStudioState>, db: &State<DbPool>) -> Result<Json<WaitlistPosition>, ApiError> {
    let user = &user_info(&session_id, state).await?;
    let class_id = parse_class_id(request.class_id.as_ref())?;
    let now = StudioDateTime::now();
    let entry = retry_on_busy(|| async move {
        let mut uow = UnitOfWork::begin(&db.0).await?;
        let entry = join(&mut uow, user, class_id, &now).await?;
        uow.commit().await?;
        Ok(entry)
    }).await?;
    Ok(Json(WaitlistPosition { position: entry.position }))
}

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct WaitlistView {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub entry: WaitlistEntry,
    pub class_name: String,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
}

#[get("/api/waitlist")]
async fn get_my_waitlist(session_id: StudioSessionId, state: &State<SharedStudioState>, db: &State<DbPool>) -> Result<Json<Vec<WaitlistView>>, ApiError> {
    let user = user_info(&session_id, state).await?;
    let entries = sqlx::query_as::<_, WaitlistView>("SELECT w.*, ct.name AS class_name, cs.date, cs.start_time
            FROM waitlist w
            JOIN class_sessions cs ON cs.id=w.class_session_id
            JOIN class_types ct ON ct.id=cs.class_type_id
            WHERE w.student_id=?
            ORDER BY cs.date, cs.start_time")
        .bind(user.id)
        .fetch_all(&db.0).await?;
    Ok(entries.into())
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
        post_waitlist,
        get_my_waitlist,
    ])
}
