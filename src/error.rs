use std::backtrace::Backtrace;
use log::error;
use rocket::http::Status;
use rocket::response::{self, Responder, Response};
use rocket::serde::json::Json;
use rocket::Request;
use serde::{Deserialize, Serialize};
use crate::datetime::StudioDateTime;

/// Error body of every API failure.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_time: Option<StudioDateTime>,
}

#[derive(Debug, Clone)]
pub struct RateLimitInfo {
    pub limit: u32,
    pub remaining: u32,
    pub reset_time: StudioDateTime,
    pub retry_after_secs: u64,
}

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("Not logged in")]
    Unauthorized,
    #[error("{0}")]
    Forbidden(String),
    #[error("Class id is required")]
    MissingClassId,
    #[error("Class id is invalid")]
    InvalidClassId,
    #[error("Id is invalid")]
    InvalidId,
    #[error("Credits to use must be at least 1")]
    InvalidCredits,
    #[error("{message}")]
    InsufficientCredits { available: i64, requested: i64, message: String },
    #[error("Class not found")]
    ClassNotFound,
    #[error("Class is full")]
    ClassFull,
    #[error("Class is not open for booking")]
    ClassNotBookable,
    #[error("You already have a booking for this class")]
    DuplicateBooking,
    #[error("Booking not found")]
    BookingNotFound,
    #[error("Booking is already cancelled")]
    AlreadyCancelled,
    #[error("Booking cannot be cancelled in status {0}")]
    InvalidBookingStatus(String),
    #[error("Class is not full, book it directly")]
    ClassNotFull,
    #[error("You are already on the waitlist for this class")]
    AlreadyOnWaitlist,
    #[error("Capacity {capacity} is below {confirmed} confirmed bookings")]
    CapacityBelowBookings { capacity: i64, confirmed: i64 },
    #[error("{what} not found")]
    NotFound { what: &'static str },
    #[error("{0}")]
    BadRequest(String),
    #[error("Request body is malformed")]
    MalformedBody,
    #[error("Too many requests")]
    RateLimitExceeded(RateLimitInfo),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn insufficient_credits(available: i64, requested: i64) -> Self {
        let message = if available == 0 {
            "You have no credits left, please purchase a package".to_string()
        } else {
            format!("Not enough credits, {available} available, {requested} required")
        };
        Self::InsufficientCredits { available, requested, message }
    }
    pub fn status(&self) -> Status {
        match self {
            ApiError::Unauthorized => Status::Unauthorized,
            ApiError::Forbidden(_) => Status::Forbidden,
            ApiError::MissingClassId
            | ApiError::InvalidClassId
            | ApiError::InvalidId
            | ApiError::InvalidCredits
            | ApiError::InsufficientCredits { .. }
            | ApiError::AlreadyCancelled
            | ApiError::InvalidBookingStatus(_)
            | ApiError::BadRequest(_) => Status::BadRequest,
            ApiError::MalformedBody => Status::UnprocessableEntity,
            ApiError::ClassNotFound
            | ApiError::BookingNotFound
            | ApiError::NotFound { .. } => Status::NotFound,
            ApiError::ClassFull
            | ApiError::ClassNotBookable
            | ApiError::DuplicateBooking
            | ApiError::ClassNotFull
            | ApiError::AlreadyOnWaitlist
            | ApiError::CapacityBelowBookings { .. } => Status::Conflict,
            ApiError::RateLimitExceeded(_) => Status::TooManyRequests,
            ApiError::Database(_)
            | ApiError::Internal(_) => Status::InternalServerError,
        }
    }
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Unauthorized => "UNAUTHORIZED",
            ApiError::Forbidden(_) => "FORBIDDEN",
            ApiError::MissingClassId => "MISSING_CLASS_ID",
            ApiError::InvalidClassId => "INVALID_CLASS_ID",
            ApiError::InvalidId => "INVALID_ID",
            ApiError::InvalidCredits => "INVALID_CREDITS",
            ApiError::InsufficientCredits { .. } => "INSUFFICIENT_CREDITS",
            ApiError::ClassNotFound => "CLASS_NOT_FOUND",
            ApiError::ClassFull => "CLASS_FULL",
            ApiError::ClassNotBookable => "CLASS_NOT_BOOKABLE",
            ApiError::DuplicateBooking => "DUPLICATE_BOOKING",
            ApiError::BookingNotFound => "BOOKING_NOT_FOUND",
            ApiError::AlreadyCancelled => "ALREADY_CANCELLED",
            ApiError::InvalidBookingStatus(_) => "INVALID_BOOKING_STATUS",
            ApiError::ClassNotFull => "CLASS_NOT_FULL",
            ApiError::AlreadyOnWaitlist => "ALREADY_ON_WAITLIST",
            ApiError::CapacityBelowBookings { .. } => "CAPACITY_BELOW_BOOKINGS",
            ApiError::NotFound { .. } => "NOT_FOUND",
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::MalformedBody => "MALFORMED_BODY",
            ApiError::RateLimitExceeded(_) => "RATE_LIMIT_EXCEEDED",
            ApiError::Database(_) => "DATABASE_ERROR",
            ApiError::Internal(_) => "INTERNAL_ERROR",
        }
    }
    pub fn body(&self) -> ErrorBody {
        let (retry_after, reset_time) = match self {
            ApiError::RateLimitExceeded(info) => (Some(info.retry_after_secs), Some(info.reset_time)),
            _ => (None, None),
        };
        ErrorBody {
            error: self.to_string(),
            code: self.code().to_string(),
            retry_after,
            reset_time,
        }
    }
}

impl<'r> Responder<'r, 'static> for ApiError {
    fn respond_to(self, request: &'r Request<'_>) -> response::Result<'static> {
        match &self {
            ApiError::Database(err) => {
                error!("SQL Error: {err}\nbacktrace: {}", Backtrace::capture());
            }
            ApiError::Internal(err) => {
                error!("Error: {err}\nbacktrace: {}", Backtrace::capture());
            }
            _ => {}
        }
        let mut builder = Response::build_from(Json(self.body()).respond_to(request)?);
        builder.status(self.status());
        if let ApiError::RateLimitExceeded(info) = &self {
            builder
                .raw_header("X-RateLimit-Limit", info.limit.to_string())
                .raw_header("X-RateLimit-Remaining", info.remaining.to_string())
                .raw_header("X-RateLimit-Reset", info.reset_time.0.timestamp().to_string())
                .raw_header("Retry-After", info.retry_after_secs.to_string());
        }
        builder.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_credits_message_distinguishes_zero() {
        let err = ApiError::insufficient_credits(0, 1);
        assert_eq!(err.code(), "INSUFFICIENT_CREDITS");
        assert!(err.to_string().contains("no credits"));
        let err = ApiError::insufficient_credits(1, 2);
        assert_eq!(err.to_string(), "Not enough credits, 1 available, 2 required");
        assert_eq!(err.status(), Status::BadRequest);
    }

    #[test]
    fn conflicts_map_to_409() {
        for err in [ApiError::ClassFull, ApiError::DuplicateBooking, ApiError::AlreadyOnWaitlist] {
            assert_eq!(err.status(), Status::Conflict);
        }
        assert_eq!(ApiError::AlreadyCancelled.status(), Status::BadRequest);
        assert_eq!(ApiError::BookingNotFound.code(), "BOOKING_NOT_FOUND");
    }

    #[test]
    fn rate_limit_body_carries_retry() {
        let reset_time = StudioDateTime::from_iso_string("2026-03-05T10:00:00Z").unwrap();
        let err = ApiError::RateLimitExceeded(RateLimitInfo { limit: 5, remaining: 0, reset_time, retry_after_secs: 42 });
        let body = serde_json::to_value(err.body()).unwrap();
        assert_eq!(body["code"], "RATE_LIMIT_EXCEEDED");
        assert_eq!(body["retryAfter"], 42);
        assert!(body["resetTime"].as_str().unwrap().starts_with("2026-03-05T10:00:00"));
    }
}
