use std::cmp::Ordering;
use anyhow::anyhow;
use log::{info, warn};
use rocket::serde::json::Json;
use rocket::{Build, Rocket, State};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqliteConnection};
use crate::auth::user_info;
use crate::datetime::StudioDateTime;
use crate::db::{DbPool, UnitOfWork};
use crate::error::ApiError;
use crate::users::{load_user, UserId};
use crate::{SharedStudioState, StudioSessionId};

pub type LotId = i64;

/// A purchased or granted batch of credits.
#[derive(Serialize, Deserialize, FromRow, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CreditLot {
    pub id: LotId,
    pub student_id: UserId,
    pub package_id: Option<i64>,
    pub credits_total: i64,
    pub credits_remaining: i64,
    pub expires_at: Option<StudioDateTime>,
    pub active: bool,
    pub created: StudioDateTime,
}
impl CreditLot {
    pub fn is_expired(&self, now: &StudioDateTime) -> bool {
        self.expires_at.map(|exp| exp <= *now).unwrap_or(false)
    }
    pub fn is_usable(&self, now: &StudioDateTime) -> bool {
        self.active && self.credits_remaining > 0 && !self.is_expired(now)
    }
}

// soonest expiration first, lots without expiration last, older lots first on a tie
fn by_expiration(a: &CreditLot, b: &CreditLot) -> Ordering {
    match (a.expires_at, b.expires_at) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }.then(a.id.cmp(&b.id))
}

pub fn available_in(lots: &[CreditLot], now: &StudioDateTime) -> i64 {
    lots.iter().filter(|lot| lot.is_usable(now)).map(|lot| lot.credits_remaining).sum()
}

#[derive(Debug, Clone, PartialEq)]
pub struct LotDeduction {
    pub lot_id: LotId,
    pub taken: i64,
    pub remaining_before: i64,
    pub remaining_after: i64,
}

/// Splits `amount` over usable lots in expiration order.
pub fn plan_deduction(lots: &[CreditLot], amount: i64, now: &StudioDateTime) -> Result<Vec<LotDeduction>, ApiError> {
    if amount < 1 {
        return Err(ApiError::InvalidCredits);
    }
    let mut usable = lots.iter().filter(|lot| lot.is_usable(now)).collect::<Vec<_>>();
    usable.sort_by(|a, b| by_expiration(a, b));
    let available: i64 = usable.iter().map(|lot| lot.credits_remaining).sum();
    if available < amount {
        return Err(ApiError::insufficient_credits(available, amount));
    }
    let mut left = amount;
    let mut plan = Vec::new();
    for lot in usable {
        if left == 0 {
            break;
        }
        let taken = left.min(lot.credits_remaining);
        left -= taken;
        plan.push(LotDeduction {
            lot_id: lot.id,
            taken,
            remaining_before: lot.credits_remaining,
            remaining_after: lot.credits_remaining - taken,
        });
    }
    Ok(plan)
}

/// Lot receiving a refund: unexpired, active lots before depleted ones, then soonest expiration.
pub fn pick_refund_lot<'a>(lots: &'a [CreditLot], now: &StudioDateTime) -> Option<&'a CreditLot> {
    lots.iter()
        .filter(|lot| !lot.is_expired(now))
        .filter(|lot| lot.active || lot.credits_remaining == 0)
        .min_by(|a, b| b.active.cmp(&a.active).then_with(|| by_expiration(a, b)))
}

pub async fn load_lots(conn: &mut SqliteConnection, student_id: UserId) -> Result<Vec<CreditLot>, sqlx::Error> {
    sqlx::query_as::<_, CreditLot>("SELECT * FROM credit_lots WHERE student_id=? ORDER BY id")
        .bind(student_id)
        .fetch_all(&mut *conn).await
}

pub async fn available_credits(conn: &mut SqliteConnection, student_id: UserId, now: &StudioDateTime) -> Result<i64, sqlx::Error> {
    let lots = load_lots(conn, student_id).await?;
    Ok(available_in(&lots, now))
}

/// Takes `amount` credits from the student's lots, returns the credits left afterwards.
pub async fn deduct(uow: &mut UnitOfWork, student_id: UserId, amount: i64, now: &StudioDateTime) -> Result<i64, ApiError> {
    let lots = load_lots(uow.conn(), student_id).await?;
    let plan = plan_deduction(&lots, amount, now)?;
    for step in &plan {
        let res = sqlx::query("UPDATE credit_lots SET credits_remaining=?, active=? WHERE id=? AND credits_remaining=?")
            .bind(step.remaining_after)
            .bind(step.remaining_after > 0)
            .bind(step.lot_id)
            .bind(step.remaining_before)
            .execute(&mut *uow.conn()).await?;
        if res.rows_affected() != 1 {
            return Err(anyhow!("Credit lot id: {} changed during deduction", step.lot_id).into());
        }
    }
    Ok(available_in(&lots, now) - amount)
}

/// Returns `amount` credits to the student, `None` when there was no lot to put them in.
pub async fn refund(uow: &mut UnitOfWork, student_id: UserId, amount: i64, now: &StudioDateTime) -> Result<Option<LotId>, ApiError> {
    if amount < 1 {
        return Ok(None);
    }
    let lots = load_lots(uow.conn(), student_id).await?;
    let Some(lot) = pick_refund_lot(&lots, now) else {
        warn!("No credit lot to refund {amount} credit(s) to, student id: {student_id}, refund dropped");
        return Ok(None);
    };
    sqlx::query("UPDATE credit_lots SET credits_remaining=credits_remaining+?, active=1 WHERE id=?")
        .bind(amount)
        .bind(lot.id)
        .execute(&mut *uow.conn()).await?;
    Ok(Some(lot.id))
}

pub async fn grant_lot(conn: &mut SqliteConnection, student_id: UserId, credits: i64, expires_at: Option<StudioDateTime>, package_id: Option<i64>) -> Result<CreditLot, ApiError> {
    if credits < 1 {
        return Err(ApiError::InvalidCredits);
    }
    load_user(conn, student_id).await?.ok_or(ApiError::NotFound { what: "Student" })?;
    let lot = sqlx::query_as::<_, CreditLot>("INSERT INTO credit_lots
                (student_id, package_id, credits_total, credits_remaining, expires_at, active, created)
                VALUES (?, ?, ?, ?, ?, 1, ?) RETURNING *")
        .bind(student_id)
        .bind(package_id)
        .bind(credits)
        .bind(credits)
        .bind(expires_at)
        .bind(StudioDateTime::now())
        .fetch_one(&mut *conn).await?;
    info!("Credit lot id: {} granted to student id: {student_id}, credits: {credits}", lot.id);
    Ok(lot)
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CreditsSummary {
    pub available: i64,
    pub lots: Vec<CreditLot>,
}
async fn credits_summary(student_id: UserId, db: &DbPool) -> Result<CreditsSummary, ApiError> {
    let mut conn = db.0.acquire().await?;
    let lots = load_lots(&mut conn, student_id).await?;
    Ok(CreditsSummary {
        available: available_in(&lots, &StudioDateTime::now()),
        lots,
    })
}

#[get("/api/credits")]
async fn get_my_credits(session_id: StudioSessionId, state: &State<SharedStudioState>, db: &State<DbPool>) -> Result<Json<CreditsSummary>, ApiError> {
    let user = user_info(&session_id, state).await?;
    Ok(credits_summary(user.id, db).await?.into())
}

#[get("/api/admin/students/<student_id>/credits")]
async fn get_student_credits(student_id: UserId, session_id: StudioSessionId, state: &State<SharedStudioState>, db: &State<DbPool>) -> Result<Json<CreditsSummary>, ApiError> {
    user_info(&session_id, state).await?.require_staff()?;
    Ok(credits_summary(student_id, db).await?.into())
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct CreditGrant {
    credits: i64,
    #[serde(default)]
    expires_at: Option<StudioDateTime>,
}
#[post("/api/admin/students/<student_id>/credits", data = "<grant>")]
async fn post_student_credits(student_id: UserId, grant: Json<CreditGrant>, session_id: StudioSessionId, state: &State<SharedStudioState>, db: &State<DbPool>) -> Result<Json<CreditLot>, ApiError> {
    user_info(&session_id, state).await?.require_admin()?;
    let mut conn = db.0.acquire().await?;
    let lot = grant_lot(&mut conn, student_id, grant.credits, grant.expires_at, None).await?;
    Ok(lot.into())
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
        get_my_credits,
        get_student_credits,
        post_student_credits,
    ])
}
