use std::fmt::{Display, Formatter};
use std::str::FromStr;
use anyhow::anyhow;
use chrono::{NaiveDate, NaiveTime};
use log::{info, warn};
use rocket::http::{ContentType, Status};
use rocket::response::status::Custom;
use rocket::serde::json::Json;
use rocket::{Build, Rocket, State};
use rocket_dyn_templates::{context, Template};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, SqliteConnection};
use crate::auth::{user_info, UserInfo};
use crate::classes::{has_capacity, load_class, load_class_slot, load_schedule_entry, ClassId, ClassSession, ClassStatus};
use crate::credits::{available_credits, deduct, refund};
use crate::datetime::StudioDateTime;
use crate::db::{retry_on_busy, DbPool, UnitOfWork};
use crate::error::ApiError;
use crate::impl_sqlx_text_type_encode_decode;
use crate::notify::{BookingNotice, CancellationNotice, Notification, NotificationHub};
use crate::policy::load_policy;
use crate::ratelimit::{ClientKey, RateLimiter};
use crate::users::{load_user, UserId};
use crate::waitlist::notify_on_seat_freed;
use crate::{AppConfig, SharedStudioState, StudioSessionId};

pub type BookingId = i64;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Confirmed,
    Cancelled,
    LateCancel,
    NoShow,
}
impl_sqlx_text_type_encode_decode!(BookingStatus);

impl Display for BookingStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            BookingStatus::Confirmed => f.write_str("confirmed"),
            BookingStatus::Cancelled => f.write_str("cancelled"),
            BookingStatus::LateCancel => f.write_str("late_cancel"),
            BookingStatus::NoShow => f.write_str("no_show"),
        }
    }
}
impl FromStr for BookingStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "confirmed" => Ok(BookingStatus::Confirmed),
            "cancelled" => Ok(BookingStatus::Cancelled),
            "late_cancel" => Ok(BookingStatus::LateCancel),
            "no_show" => Ok(BookingStatus::NoShow),
            _ => Err(anyhow!("Unknown booking status: {s}")),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CancellationType {
    OnTime,
    Late,
    NoShow,
}
impl_sqlx_text_type_encode_decode!(CancellationType);

impl Display for CancellationType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CancellationType::OnTime => f.write_str("on_time"),
            CancellationType::Late => f.write_str("late"),
            CancellationType::NoShow => f.write_str("no_show"),
        }
    }
}
impl FromStr for CancellationType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "on_time" => Ok(CancellationType::OnTime),
            "late" => Ok(CancellationType::Late),
            "no_show" => Ok(CancellationType::NoShow),
            _ => Err(anyhow!("Unknown cancellation type: {s}")),
        }
    }
}

#[derive(Serialize, Deserialize, FromRow, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Booking {
    pub id: BookingId,
    pub class_session_id: ClassId,
    pub student_id: UserId,
    pub status: BookingStatus,
    pub booked_at: StudioDateTime,
    pub cancelled_at: Option<StudioDateTime>,
    pub cancellation_type: Option<CancellationType>,
    pub credits_used: i64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CancellationDecision {
    pub cancellation_type: CancellationType,
    pub status: BookingStatus,
    pub refund: bool,
}

/// Classifies a cancellation made `hours_until_class` hours before the class starts.
pub fn classify_cancellation(hours_until_class: f64, window_hours: i64) -> CancellationDecision {
    if hours_until_class < 0. {
        CancellationDecision { cancellation_type: CancellationType::NoShow, status: BookingStatus::NoShow, refund: false }
    } else if hours_until_class < window_hours as f64 {
        CancellationDecision { cancellation_type: CancellationType::Late, status: BookingStatus::LateCancel, refund: false }
    } else {
        CancellationDecision { cancellation_type: CancellationType::OnTime, status: BookingStatus::Cancelled, refund: true }
    }
}

pub async fn load_booking(conn: &mut SqliteConnection, booking_id: BookingId) -> Result<Option<Booking>, sqlx::Error> {
    sqlx::query_as::<_, Booking>("SELECT * FROM bookings WHERE id=?")
        .bind(booking_id)
        .fetch_optional(&mut *conn).await
}

pub async fn find_confirmed_booking(conn: &mut SqliteConnection, class_id: ClassId, student_id: UserId) -> Result<Option<Booking>, sqlx::Error> {
    sqlx::query_as::<_, Booking>("SELECT * FROM bookings WHERE class_session_id=? AND student_id=? AND status='confirmed'")
        .bind(class_id)
        .bind(student_id)
        .fetch_optional(&mut *conn).await
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error().map(|e| e.is_unique_violation()).unwrap_or(false)
}

/// Books a seat for `student`, taking the credits from the ledger in the same unit of work.
pub async fn create_booking(uow: &mut UnitOfWork, student: &UserInfo, class_id: ClassId, credits_requested: i64, cfg: &AppConfig, now: &StudioDateTime) -> Result<Booking, ApiError> {
    if credits_requested < 1 {
        return Err(ApiError::InvalidCredits);
    }
    let class = load_class(uow.conn(), class_id).await?.ok_or(ApiError::ClassNotFound)?;
    if class.status != ClassStatus::Scheduled {
        return Err(ApiError::ClassNotBookable);
    }
    if find_confirmed_booking(uow.conn(), class_id, student.id).await?.is_some() {
        return Err(ApiError::DuplicateBooking);
    }
    if !has_capacity(uow.conn(), &class).await? {
        return Err(ApiError::ClassFull);
    }
    let (credits_used, credits_remaining) = if cfg.is_free_day(class.date) {
        (0, available_credits(uow.conn(), student.id, now).await?)
    } else {
        (credits_requested, deduct(uow, student.id, credits_requested, now).await?)
    };
    let booking = sqlx::query_as::<_, Booking>("INSERT INTO bookings
                (class_session_id, student_id, status, booked_at, credits_used)
                VALUES (?, ?, ?, ?, ?) RETURNING *")
        .bind(class_id)
        .bind(student.id)
        .bind(BookingStatus::Confirmed)
        .bind(now)
        .bind(credits_used)
        .fetch_one(&mut *uow.conn()).await
        .map_err(|e| if is_unique_violation(&e) { ApiError::DuplicateBooking } else { e.into() })?;
    let class_slot = load_class_slot(uow.conn(), &class).await?;
    uow.notify(Notification::BookingCreated(BookingNotice {
        booking_id: booking.id,
        student: student.contact(),
        class: class_slot,
        credits_used,
        credits_remaining,
    }));
    info!("Booking id: {} created, class id: {class_id}, student: {}, credits used: {credits_used}", booking.id, student.email);
    Ok(booking)
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CancellationDetails {
    pub cancellation_type: CancellationType,
    pub hours_until_class: f64,
    pub penalty: String,
    pub credits_refunded: i64,
    pub class_date_time: StudioDateTime,
    pub cancelled_at: StudioDateTime,
}

async fn mark_cancelled(conn: &mut SqliteConnection, booking_id: BookingId, status: BookingStatus, cancellation_type: CancellationType, now: &StudioDateTime) -> Result<(), ApiError> {
    let res = sqlx::query("UPDATE bookings SET status=?, cancelled_at=?, cancellation_type=? WHERE id=? AND status='confirmed'")
        .bind(status)
        .bind(now)
        .bind(cancellation_type)
        .bind(booking_id)
        .execute(&mut *conn).await?;
    if res.rows_affected() != 1 {
        return Err(ApiError::AlreadyCancelled);
    }
    Ok(())
}

async fn refund_booking(uow: &mut UnitOfWork, booking: &Booking, now: &StudioDateTime) -> Result<i64, ApiError> {
    if booking.credits_used < 1 {
        return Ok(0);
    }
    let lot = refund(uow, booking.student_id, booking.credits_used, now).await?;
    Ok(if lot.is_some() { booking.credits_used } else { 0 })
}

async fn student_contact(conn: &mut SqliteConnection, student_id: UserId) -> Result<crate::notify::Contact, ApiError> {
    let student = load_user(conn, student_id).await?.ok_or(ApiError::NotFound { what: "Student" })?;
    Ok(student.contact())
}

/// Cancels a confirmed booking on behalf of `actor`, the cancellation policy decides about the refund.
pub async fn cancel_booking(uow: &mut UnitOfWork, actor: &UserInfo, booking_id: BookingId, cfg: &AppConfig, now: &StudioDateTime) -> Result<(Booking, CancellationDetails), ApiError> {
    let booking = load_booking(uow.conn(), booking_id).await?.ok_or(ApiError::BookingNotFound)?;
    if booking.student_id != actor.id && !actor.is_admin() {
        return Err(ApiError::Forbidden("You can cancel your own bookings only".to_string()));
    }
    match booking.status {
        BookingStatus::Confirmed => {}
        BookingStatus::Cancelled | BookingStatus::LateCancel => return Err(ApiError::AlreadyCancelled),
        status => return Err(ApiError::InvalidBookingStatus(status.to_string())),
    }
    let class = load_class(uow.conn(), booking.class_session_id).await?.ok_or(ApiError::ClassNotFound)?;
    let class_date_time = class.starts_at(cfg)?;
    let hours_until_class = now.hours_until(&class_date_time);
    let policy = load_policy(uow.conn(), cfg).await?;
    let decision = classify_cancellation(hours_until_class, policy.cancellation_window_hours);
    mark_cancelled(uow.conn(), booking_id, decision.status, decision.cancellation_type, now).await?;
    let credits_refunded = if decision.refund {
        refund_booking(uow, &booking, now).await?
    } else {
        0
    };
    let penalty = policy.penalty(decision.cancellation_type).to_string();
    let student = student_contact(uow.conn(), booking.student_id).await?;
    let class_slot = load_class_slot(uow.conn(), &class).await?;
    uow.notify(Notification::Cancellation(CancellationNotice {
        booking_id,
        student,
        class: class_slot,
        cancellation_type: decision.cancellation_type,
        penalty: penalty.clone(),
        credits_refunded,
    }));
    info!("Booking id: {booking_id} cancelled by: {}, type: {}, refunded: {credits_refunded}", actor.email, decision.cancellation_type);
    let booking = load_booking(uow.conn(), booking_id).await?.ok_or(ApiError::BookingNotFound)?;
    Ok((booking, CancellationDetails {
        cancellation_type: decision.cancellation_type,
        hours_until_class: (hours_until_class * 100.).round() / 100.,
        penalty,
        credits_refunded,
        class_date_time,
        cancelled_at: *now,
    }))
}

/// Cancels every confirmed booking of a class the studio called off, all of them refunded.
/// Returns the number of bookings cancelled and the credits refunded.
pub async fn cancel_bookings_of_cancelled_class(uow: &mut UnitOfWork, class: &ClassSession, cfg: &AppConfig, now: &StudioDateTime) -> Result<(usize, i64), ApiError> {
    let bookings = sqlx::query_as::<_, Booking>("SELECT * FROM bookings WHERE class_session_id=? AND status='confirmed' ORDER BY id")
        .bind(class.id)
        .fetch_all(&mut *uow.conn()).await?;
    let policy = load_policy(uow.conn(), cfg).await?;
    let class_slot = load_class_slot(uow.conn(), class).await?;
    let mut credits_total = 0;
    for booking in &bookings {
        mark_cancelled(uow.conn(), booking.id, BookingStatus::Cancelled, CancellationType::OnTime, now).await?;
        let credits_refunded = refund_booking(uow, booking, now).await?;
        credits_total += credits_refunded;
        let student = student_contact(uow.conn(), booking.student_id).await?;
        uow.notify(Notification::Cancellation(CancellationNotice {
            booking_id: booking.id,
            student,
            class: class_slot.clone(),
            cancellation_type: CancellationType::OnTime,
            penalty: policy.penalty(CancellationType::OnTime).to_string(),
            credits_refunded,
        }));
    }
    Ok((bookings.len(), credits_total))
}

fn positive_id(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }.filter(|id| *id > 0)
}

pub(crate) fn parse_class_id(value: Option<&Value>) -> Result<ClassId, ApiError> {
    match value {
        None | Some(Value::Null) => Err(ApiError::MissingClassId),
        Some(Value::String(s)) if s.trim().is_empty() => Err(ApiError::MissingClassId),
        Some(value) => positive_id(value).ok_or(ApiError::InvalidClassId),
    }
}

fn parse_credits(value: Option<&Value>) -> Result<i64, ApiError> {
    match value {
        None | Some(Value::Null) => Ok(1),
        Some(Value::Number(n)) => n.as_i64().filter(|n| *n >= 1).ok_or(ApiError::InvalidCredits),
        Some(_) => Err(ApiError::InvalidCredits),
    }
}

fn parse_booking_id(segment: &str) -> Result<BookingId, ApiError> {
    segment.parse::<BookingId>().ok().filter(|id| *id > 0).ok_or(ApiError::InvalidId)
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct BookingRequest {
    #[serde(default)]
    class_id: Option<Value>,
    #[serde(default)]
    credits_used: Option<Value>,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct BookingConfirmation {
    pub booking: Booking,
    pub message: String,
}

#[post("/api/bookings", data = "<request>")]
async fn post_booking(request: Json<BookingRequest>, session_id: StudioSessionId, state: &State<SharedStudioState>, db: &State<DbPool>, cfg: &State<AppConfig>, hub: &State<NotificationHub>) -> Result<Custom<Json<BookingConfirmation>>, ApiError> {
    let user = &user_info(&session_id, state).await?;
    let class_id = parse_class_id(request.class_id.as_ref())?;
    let credits = parse_credits(request.credits_used.as_ref())?;
    let now = StudioDateTime::now();
    let (booking, notifications) = retry_on_busy(|| async move {
        let mut uow = UnitOfWork::begin(&db.0).await?;
        let booking = create_booking(&mut uow, user, class_id, credits, cfg, &now).await?;
        let notifications = uow.commit().await?;
        Ok((booking, notifications))
    }).await?;
    hub.publish(notifications);
    let message = if booking.credits_used == 0 {
        "Booking confirmed, this class is free".to_string()
    } else {
        format!("Booking confirmed, {} credit(s) used", booking.credits_used)
    };
    Ok(Custom(Status::Created, Json(BookingConfirmation { booking, message })))
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CancellationResult {
    pub booking: Booking,
    pub cancellation_details: CancellationDetails,
    pub message: String,
}

#[post("/api/bookings/<booking_id>/cancel")]
async fn post_cancel_booking(booking_id: &str, session_id: Option<StudioSessionId>, client: ClientKey, limiter: &State<RateLimiter>, state: &State<SharedStudioState>, db: &State<DbPool>, cfg: &State<AppConfig>, hub: &State<NotificationHub>) -> Result<Json<CancellationResult>, ApiError> {
    let now = StudioDateTime::now();
    limiter.check(&client.0, &cfg.cancel_rate_limit, now).await?;
    let session_id = session_id.ok_or(ApiError::Unauthorized)?;
    let user = &user_info(&session_id, state).await?;
    let booking_id = parse_booking_id(booking_id)?;
    let ((booking, details), notifications) = retry_on_busy(|| async move {
        let mut uow = UnitOfWork::begin(&db.0).await?;
        let res = cancel_booking(&mut uow, user, booking_id, cfg, &now).await?;
        let notifications = uow.commit().await?;
        Ok((res, notifications))
    }).await?;
    hub.publish(notifications);
    if let Err(e) = notify_on_seat_freed(&db.0, booking.class_session_id, hub).await {
        warn!("Waitlist notification for class id: {} failed: {e}", booking.class_session_id);
    }
    let message = match details.cancellation_type {
        CancellationType::OnTime => format!("Booking cancelled, {} credit(s) refunded", details.credits_refunded),
        CancellationType::Late => format!("Late cancellation, penalty: {}", details.penalty),
        CancellationType::NoShow => format!("Booking marked as no-show, penalty: {}", details.penalty),
    };
    Ok(Json(CancellationResult { booking, cancellation_details: details, message }))
}

/// Booking as listed to its student.
#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct BookingView {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub booking: Booking,
    pub class_name: String,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub class_status: ClassStatus,
}

pub async fn load_student_bookings(conn: &mut SqliteConnection, student_id: UserId) -> Result<Vec<BookingView>, sqlx::Error> {
    sqlx::query_as::<_, BookingView>("SELECT b.*, ct.name AS class_name, cs.date, cs.start_time, cs.status AS class_status
            FROM bookings b
            JOIN class_sessions cs ON cs.id=b.class_session_id
            JOIN class_types ct ON ct.id=cs.class_type_id
            WHERE b.student_id=?
            ORDER BY cs.date DESC, cs.start_time DESC, b.id DESC")
        .bind(student_id)
        .fetch_all(&mut *conn).await
}

#[get("/api/bookings")]
async fn get_my_bookings(session_id: StudioSessionId, state: &State<SharedStudioState>, db: &State<DbPool>) -> Result<Json<Vec<BookingView>>, ApiError> {
    let user = user_info(&session_id, state).await?;
    let mut conn = db.0.acquire().await?;
    Ok(load_student_bookings(&mut conn, user.id).await?.into())
}

#[get("/bookings")]
async fn get_bookings_page(session_id: StudioSessionId, state: &State<SharedStudioState>, db: &State<DbPool>) -> Result<Template, ApiError> {
    let user = user_info(&session_id, state).await?;
    let mut conn = db.0.acquire().await?;
    let bookings = load_student_bookings(&mut conn, user.id).await?;
    let credits = available_credits(&mut conn, user.id, &StudioDateTime::now()).await?;
    Ok(Template::render("bookings", context! {
        user,
        bookings,
        credits,
    }))
}

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    pub booking_id: BookingId,
    pub student_id: UserId,
    pub student_name: String,
    pub student_email: String,
    pub status: BookingStatus,
    pub booked_at: StudioDateTime,
    pub credits_used: i64,
}

pub async fn load_roster(conn: &mut SqliteConnection, class_id: ClassId) -> Result<Vec<RosterEntry>, sqlx::Error> {
    sqlx::query_as::<_, RosterEntry>("SELECT b.id AS booking_id, u.id AS student_id, u.name AS student_name, u.email AS student_email,
                b.status, b.booked_at, b.credits_used
            FROM bookings b
            JOIN users u ON u.id=b.student_id
            WHERE b.class_session_id=?
            ORDER BY b.status<>'confirmed', b.booked_at, b.id")
        .bind(class_id)
        .fetch_all(&mut *conn).await
}

fn roster_csv(roster: &[RosterEntry]) -> anyhow::Result<String> {
    let mut wr = csv::Writer::from_writer(vec![]);
    wr.write_record(["booking_id", "student_name", "student_email", "status", "booked_at", "credits_used"])?;
    for entry in roster {
        wr.write_record([
            entry.booking_id.to_string(),
            entry.student_name.clone(),
            entry.student_email.clone(),
            entry.status.to_string(),
            entry.booked_at.to_display_string(),
            entry.credits_used.to_string(),
        ])?;
    }
    let data = wr.into_inner().map_err(|e| anyhow!("CSV flush error: {e}"))?;
    Ok(String::from_utf8(data)?)
}

#[get("/api/admin/classes/<class_id>/roster")]
async fn get_roster(class_id: ClassId, session_id: StudioSessionId, state: &State<SharedStudioState>, db: &State<DbPool>) -> Result<Json<Vec<RosterEntry>>, ApiError> {
    user_info(&session_id, state).await?.require_staff()?;
    let mut conn = db.0.acquire().await?;
    load_class(&mut conn, class_id).await?.ok_or(ApiError::ClassNotFound)?;
    Ok(load_roster(&mut conn, class_id).await?.into())
}

#[get("/api/admin/classes/<class_id>/roster.csv")]
async fn get_roster_csv(class_id: ClassId, session_id: StudioSessionId, state: &State<SharedStudioState>, db: &State<DbPool>) -> Result<(ContentType, String), ApiError> {
    user_info(&session_id, state).await?.require_staff()?;
    let mut conn = db.0.acquire().await?;
    load_class(&mut conn, class_id).await?.ok_or(ApiError::ClassNotFound)?;
    let roster = load_roster(&mut conn, class_id).await?;
    Ok((ContentType::CSV, roster_csv(&roster)?))
}

#[get("/admin/class/<class_id>")]
async fn get_roster_page(class_id: ClassId, session_id: StudioSessionId, state: &State<SharedStudioState>, db: &State<DbPool>) -> Result<Template, ApiError> {
    let user = user_info(&session_id, state).await?.require_staff()?;
    let mut conn = db.0.acquire().await?;
    let class = load_schedule_entry(&mut conn, class_id).await?.ok_or(ApiError::ClassNotFound)?;
    let roster = load_roster(&mut conn, class_id).await?;
    Ok(Template::render("roster", context! {
        user,
        class,
        roster,
    }))
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
        post_booking,
        post_cancel_booking,
        get_my_bookings,
        get_bookings_page,
        get_roster,
        get_roster_csv,
        get_roster_page,
    ])
}
