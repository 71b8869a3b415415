use std::collections::HashMap;
use std::path::Path;
use anyhow::{anyhow, Context};
use chrono::{NaiveDate, NaiveTime, TimeDelta};
use log::info;
use rocket::response::Redirect;
use rocket::{Build, Rocket, State};
use serde::Deserialize;
use sqlx::SqlitePool;
use crate::auth::user_info;
use crate::classes::{insert_class_session, insert_class_type, NewClassSession, NewClassType};
use crate::db::DbPool;
use crate::error::ApiError;
use crate::packages::{insert_package, NewPackage};
use crate::users::{upsert_user, Role, UserId};
use crate::{AppConfig, SharedStudioState, StudioSessionId};

pub const DEMO_STUDIO_FILE: &str = "demo/studio.yaml";

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct DemoInstructor {
    pub email: String,
    pub name: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct DemoClass {
    pub class_type: String,
    #[serde(default)]
    pub instructor: Option<String>,
    /// days after the seeding day
    pub day_offset: i64,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub capacity: i64,
}

/// Studio fixture for trying the server out.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct DemoStudio {
    #[serde(default)]
    pub class_types: Vec<NewClassType>,
    #[serde(default)]
    pub instructors: Vec<DemoInstructor>,
    #[serde(default)]
    pub packages: Vec<NewPackage>,
    #[serde(default)]
    pub classes: Vec<DemoClass>,
}

pub fn parse_demo_studio(yaml: &str) -> anyhow::Result<DemoStudio> {
    Ok(serde_yaml::from_str(yaml)?)
}

pub fn load_demo_studio(path: &Path) -> anyhow::Result<DemoStudio> {
    let yaml = std::fs::read_to_string(path).with_context(|| format!("Cannot read demo studio file {}", path.to_string_lossy()))?;
    parse_demo_studio(&yaml)
}

#[derive(Debug, Default, PartialEq)]
pub struct SeedStats {
    pub class_types: usize,
    pub instructors: usize,
    pub packages: usize,
    pub classes: usize,
}

/// Writes the demo studio into an empty database, classes are dated relative to `today`.
pub async fn seed_demo_studio(pool: &SqlitePool, studio: &DemoStudio, today: NaiveDate) -> Result<SeedStats, ApiError> {
    let existing: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM class_sessions")
        .fetch_one(pool).await?;
    if existing.0 > 0 {
        return Err(ApiError::BadRequest("Studio already has classes, demo not loaded".to_string()));
    }
    let mut stats = SeedStats::default();
    let mut instructors: HashMap<String, UserId> = HashMap::new();
    for instructor in &studio.instructors {
        let user = upsert_user(pool, &instructor.email, &instructor.name, &[]).await?;
        if user.role == Role::Student {
            sqlx::query("UPDATE users SET role=? WHERE id=?")
                .bind(Role::Instructor)
                .bind(user.id)
                .execute(pool).await?;
        }
        instructors.insert(user.email, user.id);
        stats.instructors += 1;
    }
    let mut conn = pool.acquire().await?;
    let mut class_types: HashMap<String, i64> = HashMap::new();
    for class_type in &studio.class_types {
        let rec = insert_class_type(&mut conn, class_type).await?;
        class_types.insert(rec.name, rec.id);
        stats.class_types += 1;
    }
    for package in &studio.packages {
        insert_package(&mut conn, package).await?;
        stats.packages += 1;
    }
    for class in &studio.classes {
        let class_type_id = *class_types.get(&class.class_type)
            .ok_or_else(|| anyhow!("Unknown class type {} in demo studio", class.class_type))?;
        let instructor_id = match &class.instructor {
            Some(email) => Some(*instructors.get(&email.to_lowercase())
                .ok_or_else(|| anyhow!("Unknown instructor {email} in demo studio"))?),
            None => None,
        };
        let date = today.checked_add_signed(TimeDelta::days(class.day_offset))
            .ok_or_else(|| anyhow!("Day offset {} out of range", class.day_offset))?;
        insert_class_session(&mut conn, &NewClassSession {
            class_type_id,
            instructor_id,
            date,
            start_time: class.start_time,
            end_time: class.end_time,
            capacity: class.capacity,
        }).await?;
        stats.classes += 1;
    }
    info!("Demo studio loaded: {stats:?}");
    Ok(stats)
}

#[get("/admin/seed-demo")]
async fn get_seed_demo(session_id: StudioSessionId, state: &State<SharedStudioState>, db: &State<DbPool>, cfg: &State<AppConfig>) -> Result<Redirect, ApiError> {
    user_info(&session_id, state).await?.require_admin()?;
    let studio = load_demo_studio(Path::new(DEMO_STUDIO_FILE))?;
    seed_demo_studio(&db.0, &studio, cfg.studio_today()).await?;
    Ok(Redirect::to("/"))
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
        get_seed_demo,
    ])
}

#[test]
fn test_demo_studio_fixture_parses() {
    let studio = parse_demo_studio(include_str!("../demo/studio.yaml")).unwrap();
    assert!(!studio.class_types.is_empty());
    assert!(!studio.packages.is_empty());
    for class in &studio.classes {
        assert!(studio.class_types.iter().any(|t| t.name == class.class_type), "unknown class type {}", class.class_type);
        assert!(class.end_time > class.start_time);
    }
}
