use anyhow::anyhow;
use log::info;
use rocket::serde::json::Json;
use rocket::{Build, Rocket, State};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqliteConnection};
use crate::auth::user_info;
use crate::credits::{grant_lot, CreditLot};
use crate::datetime::StudioDateTime;
use crate::db::DbPool;
use crate::error::ApiError;
use crate::users::UserId;
use crate::{SharedStudioState, StudioSessionId};

pub type PackageId = i64;

/// Credit package offered by the studio, paid outside of this server.
#[derive(Serialize, Deserialize, FromRow, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Package {
    pub id: PackageId,
    pub name: String,
    pub credits: i64,
    pub price_cents: i64,
    pub validity_days: Option<i64>,
    pub payment_link: Option<String>,
    pub active: bool,
}
impl Package {
    /// Expiration of a lot bought at `purchased`.
    pub fn expires_at(&self, purchased: &StudioDateTime) -> Option<StudioDateTime> {
        self.validity_days.and_then(|days| purchased.checked_add_days(days))
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct NewPackage {
    pub name: String,
    pub credits: i64,
    #[serde(default)]
    pub price_cents: i64,
    #[serde(default)]
    pub validity_days: Option<i64>,
    #[serde(default)]
    pub payment_link: Option<String>,
}

pub async fn insert_package(conn: &mut SqliteConnection, package: &NewPackage) -> Result<Package, ApiError> {
    if package.name.trim().is_empty() {
        return Err(ApiError::BadRequest("Package name must be set".to_string()));
    }
    if package.credits < 1 {
        return Err(ApiError::InvalidCredits);
    }
    if package.validity_days.is_some_and(|days| days < 1) {
        return Err(ApiError::BadRequest("Package validity must be at least one day".to_string()));
    }
    let rec = sqlx::query_as::<_, Package>("INSERT INTO packages (name, credits, price_cents, validity_days, payment_link, active)
                VALUES (?, ?, ?, ?, ?, 1) RETURNING *")
        .bind(package.name.trim())
        .bind(package.credits)
        .bind(package.price_cents)
        .bind(package.validity_days)
        .bind(&package.payment_link)
        .fetch_one(&mut *conn).await?;
    info!("Package id: {} created, name: {}, credits: {}", rec.id, rec.name, rec.credits);
    Ok(rec)
}

pub async fn load_package(conn: &mut SqliteConnection, package_id: PackageId) -> Result<Option<Package>, sqlx::Error> {
    sqlx::query_as::<_, Package>("SELECT * FROM packages WHERE id=?")
        .bind(package_id)
        .fetch_optional(&mut *conn).await
}

/// Records a purchase made outside of the studio server as a new credit lot.
pub async fn record_purchase(conn: &mut SqliteConnection, student_id: UserId, package_id: PackageId, now: &StudioDateTime) -> Result<CreditLot, ApiError> {
    let package = load_package(conn, package_id).await?.ok_or(ApiError::NotFound { what: "Package" })?;
    if !package.active {
        return Err(ApiError::BadRequest(format!("Package {} is not offered anymore", package.name)));
    }
    let expires_at = match package.validity_days {
        Some(days) => Some(package.expires_at(now).ok_or_else(|| anyhow!("Package validity {days} days out of range"))?),
        None => None,
    };
    grant_lot(conn, student_id, package.credits, expires_at, Some(package.id)).await
}

#[get("/api/packages")]
async fn get_packages(db: &State<DbPool>) -> Result<Json<Vec<Package>>, ApiError> {
    let packages = sqlx::query_as::<_, Package>("SELECT * FROM packages WHERE active=1 ORDER BY price_cents, id")
        .fetch_all(&db.0).await?;
    Ok(packages.into())
}

#[post("/api/admin/packages", data = "<package>")]
async fn post_package(package: Json<NewPackage>, session_id: StudioSessionId, state: &State<SharedStudioState>, db: &State<DbPool>) -> Result<Json<Package>, ApiError> {
    user_info(&session_id, state).await?.require_admin()?;
    let mut conn = db.0.acquire().await?;
    Ok(insert_package(&mut conn, &package).await?.into())
}

#[post("/api/admin/packages/<package_id>/deactivate")]
async fn post_package_deactivate(package_id: PackageId, session_id: StudioSessionId, state: &State<SharedStudioState>, db: &State<DbPool>) -> Result<Json<Package>, ApiError> {
    user_info(&session_id, state).await?.require_admin()?;
    let mut conn = db.0.acquire().await?;
    let res = sqlx::query("UPDATE packages SET active=0 WHERE id=?")
        .bind(package_id)
        .execute(&mut *conn).await?;
    if res.rows_affected() == 0 {
        return Err(ApiError::NotFound { what: "Package" });
    }
    let package = load_package(&mut conn, package_id).await?.ok_or(ApiError::NotFound { what: "Package" })?;
    Ok(package.into())
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct Purchase {
    package_id: PackageId,
}
#[post("/api/admin/students/<student_id>/purchases", data = "<purchase>")]
async fn post_purchase(student_id: UserId, purchase: Json<Purchase>, session_id: StudioSessionId, state: &State<SharedStudioState>, db: &State<DbPool>) -> Result<Json<CreditLot>, ApiError> {
    let admin = user_info(&session_id, state).await?.require_admin()?;
    let mut conn = db.0.acquire().await?;
    let lot = record_purchase(&mut conn, student_id, purchase.package_id, &StudioDateTime::now()).await?;
    info!("Purchase of package id: {} recorded for student id: {student_id} by: {}", purchase.package_id, admin.email);
    Ok(lot.into())
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
        get_packages,
        post_package,
        post_package_deactivate,
        post_purchase,
    ])
}

#[test]
fn package_validity_sets_lot_expiration() {
    let package = Package {
        id: 1,
        name: "10 classes".to_string(),
        credits: 10,
        price_cents: 15000,
        validity_days: Some(90),
        payment_link: None,
        active: true,
    };
    let purchased = StudioDateTime::from_iso_string("2026-03-05T10:00:00+01:00").unwrap();
    assert_eq!(package.expires_at(&purchased).unwrap().to_iso_string(), "2026-06-03T10:00:00+01:00");
    let unlimited = Package { validity_days: None, ..package };
    assert!(unlimited.expires_at(&purchased).is_none());
}
