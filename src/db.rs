use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use log::{error, info, warn};
use rocket::fairing::{Fairing, Info, Kind};
use rocket::{Build, Rocket};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, SqliteConnection, Transaction};
use crate::error::ApiError;
use crate::notify::Notification;

// macro to store an enum as SQL text, the enum must implement Display and FromStr
#[macro_export]
macro_rules! impl_sqlx_text_type_encode_decode {
    ($type:ident) => {
        impl<DB: sqlx::Database> sqlx::Type<DB> for $type
        where str: sqlx::Type<DB>
        {
            fn type_info() -> <DB as sqlx::Database>::TypeInfo {
                // TEXT columns only
                <&str as sqlx::Type<DB>>::type_info()
            }
        }

        impl<'r, DB: sqlx::Database> sqlx::Decode<'r, DB> for $type
        where &'r str: sqlx::Decode<'r, DB>
        {
            fn decode(value: <DB as sqlx::Database>::ValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
                let value = <&str as sqlx::Decode<DB>>::decode(value)?;
                Ok(<$type as std::str::FromStr>::from_str(value)?)
            }
        }

        impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for $type {
            fn encode_by_ref(&self, buf: &mut <sqlx::Sqlite as sqlx::Database>::ArgumentBuffer<'q>) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
                <String as sqlx::Encode<'q, sqlx::Sqlite>>::encode(self.to_string(), buf)
            }
        }
    };
}

static MIGRATOR: Migrator = sqlx::migrate!("db/migrations");

pub struct DbPool(pub SqlitePool);

pub struct DbPoolFairing();
#[rocket::async_trait]
impl Fairing for DbPoolFairing {
    fn info(&self) -> Info {
        Info {
            name: "SQLite Database Pool with Migrations",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, rocket: Rocket<Build>) -> rocket::fairing::Result {
        let opts = if cfg!(test) {
            // every test server gets its own database file
            let path = std::env::temp_dir().join(format!("studiohttpd-test-{:016x}.sqlite", rand::random::<u64>()));
            info!("Opening test database: {}", path.to_string_lossy());
            Ok(SqliteConnectOptions::new().filename(path))
        } else {
            let figment = rocket.figment();
            let database_url = figment.extract_inner::<String>("database_url")
                .unwrap_or_else(|_| "sqlite://studio.sqlite".to_string());
            info!("Opening database: {database_url}");
            SqliteConnectOptions::from_str(&database_url)
        };
        let opts = match opts {
            Ok(opts) => opts
                .create_if_missing(true)
                .foreign_keys(true)
                .busy_timeout(Duration::from_secs(5))
                .journal_mode(SqliteJournalMode::Wal), // use WAL for better concurrency
            Err(err) => {
                error!("Invalid database url: {err}");
                return Err(rocket);
            }
        };
        let pool = match SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await
        {
            Ok(pool) => pool,
            Err(err) => {
                error!("Database connection error: {:?}", err);
                return Err(rocket);
            }
        };

        match MIGRATOR.run(&pool).await {
            Ok(_) => info!("Migrations applied successfully!"),
            Err(err) => {
                error!("Migration error: {:?}", err);
                return Err(rocket);
            }
        };

        Ok(rocket.manage(DbPool(pool)))
    }
}

/// One request worth of database work.
///
/// All ledger, booking and waitlist mutations of a request go through the same
/// transaction. Notifications produced on the way are kept in the outbox and handed
/// back by [`UnitOfWork::commit`], so nothing is announced for work that was rolled back.
/// Dropping the unit of work without commit rolls the transaction back.
pub struct UnitOfWork {
    tx: Transaction<'static, Sqlite>,
    outbox: Vec<Notification>,
}
impl UnitOfWork {
    pub async fn begin(pool: &SqlitePool) -> Result<Self, sqlx::Error> {
        Ok(Self {
            tx: pool.begin().await?,
            outbox: Vec::new(),
        })
    }
    pub fn conn(&mut self) -> &mut SqliteConnection {
        &mut *self.tx
    }
    pub fn notify(&mut self, notification: Notification) {
        self.outbox.push(notification);
    }
    pub async fn commit(self) -> Result<Vec<Notification>, sqlx::Error> {
        self.tx.commit().await?;
        Ok(self.outbox)
    }
}

/// SQLite refuses a write from a transaction whose snapshot went stale (BUSY_SNAPSHOT),
/// or one that could not get the write lock in time (BUSY). Both are safe to retry.
pub fn is_busy_error(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|e| e.code())
        .and_then(|code| code.parse::<i32>().ok())
        .map(|code| code & 0xff == 5)
        .unwrap_or(false)
}

const UNIT_OF_WORK_ATTEMPTS: usize = 3;

/// Runs a whole unit of work again when it lost a write race.
pub async fn retry_on_busy<T, F, Fut>(mut work: F) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut attempt = 1;
    loop {
        match work().await {
            Err(ApiError::Database(err)) if is_busy_error(&err) && attempt < UNIT_OF_WORK_ATTEMPTS => {
                warn!("Database busy, retrying unit of work, attempt: {attempt}, error: {err}");
                attempt += 1;
                rocket::tokio::time::sleep(Duration::from_millis(20 * attempt as u64)).await;
            }
            res => return res,
        }
    }
}
