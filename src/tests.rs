use chrono::{TimeDelta, Timelike, Utc};
use rocket::figment::Figment;
use rocket::figment::providers::Serialized;
use rocket::http::{ContentType, Cookie, Status};
use rocket::local::blocking::Client;
use serde_json::{json, Value};
use crate::auth::STUDIO_SESSION_ID;

const ADMIN_EMAIL: &str = "admin@studio.test";
const FREE_DAY: &str = "2030-01-01";
const CANCEL_RATE_LIMIT: u32 = 5;

struct Studio {
    client: Client,
    admin: Cookie<'static>,
    class_type_id: i64,
}

struct Student {
    id: i64,
    cookie: Cookie<'static>,
}

fn test_figment() -> Figment {
    rocket::Config::figment()
        .merge(Serialized::global("studio.dev_login", true))
        .merge(Serialized::global("studio.admin_emails", vec![ADMIN_EMAIL]))
        .merge(Serialized::global("studio.utc_offset_minutes", 0))
        .merge(Serialized::global("studio.cancellation_window_hours", 24))
        .merge(Serialized::global("studio.free_class_dates", vec![FREE_DAY]))
        .merge(Serialized::global("studio.notification_backoff_secs", 0))
        .merge(Serialized::global("studio.cancel_rate_limit.max_requests", CANCEL_RATE_LIMIT))
}

fn create_test_server() -> Client {
    Client::untracked(super::build_rocket(test_figment())).unwrap()
}

impl Studio {
    fn new() -> Self {
        let client = create_test_server();
        let admin = login(&client, ADMIN_EMAIL);
        let mut studio = Self { client, admin, class_type_id: 0 };
        let (status, class_type) = studio.post(&studio.admin, "/api/admin/class-types", json!({"name": "Reformer", "durationMinutes": 50}));
        assert_eq!(status, Status::Ok);
        studio.class_type_id = class_type["id"].as_i64().unwrap();
        studio
    }
    fn post(&self, cookie: &Cookie<'static>, url: &str, body: Value) -> (Status, Value) {
        let resp = self.client.post(url)
            .private_cookie(cookie.clone())
            .header(ContentType::JSON)
            .body(body.to_string())
            .dispatch();
        let status = resp.status();
        (status, resp.into_json::<Value>().unwrap_or(Value::Null))
    }
    fn get(&self, cookie: &Cookie<'static>, url: &str) -> (Status, Value) {
        let resp = self.client.get(url)
            .private_cookie(cookie.clone())
            .dispatch();
        let status = resp.status();
        (status, resp.into_json::<Value>().unwrap_or(Value::Null))
    }
    fn student(&self, email: &str, credits: i64) -> Student {
        let cookie = login(&self.client, email);
        let (status, me) = self.get(&cookie, "/api/me");
        assert_eq!(status, Status::Ok);
        let id = me["id"].as_i64().unwrap();
        if credits > 0 {
            let (status, _) = self.post(&self.admin, &format!("/api/admin/students/{id}/credits"), json!({"credits": credits}));
            assert_eq!(status, Status::Ok);
        }
        Student { id, cookie }
    }
    /// Creates a class starting roughly `hours` from now.
    fn class_in(&self, hours: i64, capacity: i64) -> i64 {
        let mut start = Utc::now() + TimeDelta::hours(hours);
        if start.hour() >= 23 {
            start -= TimeDelta::hours(1);
        }
        let end = start + TimeDelta::minutes(30);
        self.create_class(&start.format("%F").to_string(), &start.format("%H:%M:00").to_string(), &end.format("%H:%M:00").to_string(), capacity)
    }
    fn create_class(&self, date: &str, start_time: &str, end_time: &str, capacity: i64) -> i64 {
        let (status, class) = self.post(&self.admin, "/api/admin/classes", json!({
            "classTypeId": self.class_type_id,
            "date": date,
            "startTime": start_time,
            "endTime": end_time,
            "capacity": capacity,
        }));
        assert_eq!(status, Status::Ok, "create class: {class}");
        class["id"].as_i64().unwrap()
    }
    fn book(&self, student: &Student, class_id: i64) -> (Status, Value) {
        self.post(&student.cookie, "/api/bookings", json!({"classId": class_id}))
    }
    fn cancel(&self, cookie: &Cookie<'static>, booking_id: i64) -> (Status, Value) {
        self.post(cookie, &format!("/api/bookings/{booking_id}/cancel"), json!({}))
    }
    fn credits(&self, student: &Student) -> i64 {
        let (status, credits) = self.get(&student.cookie, "/api/credits");
        assert_eq!(status, Status::Ok);
        credits["available"].as_i64().unwrap()
    }
    fn confirmed_count(&self, class_id: i64) -> i64 {
        let (status, class) = self.get(&self.admin, &format!("/api/classes/{class_id}"));
        assert_eq!(status, Status::Ok);
        class["confirmedCount"].as_i64().unwrap()
    }
}

fn login(client: &Client, email: &str) -> Cookie<'static> {
    let resp = client.get(format!("/login/dev?email={email}")).dispatch();
    assert_eq!(resp.status(), Status::SeeOther);
    resp.cookies().get_private(STUDIO_SESSION_ID).expect("session cookie")
}

fn booked(studio: &Studio, student: &Student, class_id: i64) -> i64 {
    let (status, body) = studio.book(student, class_id);
    assert_eq!(status, Status::Created, "booking: {body}");
    body["booking"]["id"].as_i64().unwrap()
}

#[test]
fn last_seat_goes_to_first_student() {
    let studio = Studio::new();
    let class_id = studio.class_in(48, 1);
    let ann = studio.student("ann@studio.test", 1);
    let bob = studio.student("bob@studio.test", 1);

    let (status, body) = studio.book(&ann, class_id);
    assert_eq!(status, Status::Created);
    assert_eq!(body["booking"]["status"], "confirmed");
    assert_eq!(body["booking"]["creditsUsed"], 1);
    assert!(body["message"].is_string());
    assert_eq!(studio.credits(&ann), 0);

    let (status, body) = studio.book(&bob, class_id);
    assert_eq!(status, Status::Conflict);
    assert_eq!(body["code"], "CLASS_FULL");
    assert_eq!(studio.credits(&bob), 1);
    assert_eq!(studio.confirmed_count(class_id), 1);
}

#[test]
fn on_time_cancellation_refunds() {
    let studio = Studio::new();
    let class_id = studio.class_in(30, 5);
    let ann = studio.student("ann@studio.test", 2);
    let booking_id = booked(&studio, &ann, class_id);
    assert_eq!(studio.credits(&ann), 1);

    let (status, body) = studio.cancel(&ann.cookie, booking_id);
    assert_eq!(status, Status::Ok, "cancel: {body}");
    assert_eq!(body["booking"]["status"], "cancelled");
    assert_eq!(body["booking"]["cancellationType"], "on_time");
    let details = &body["cancellationDetails"];
    assert_eq!(details["cancellationType"], "on_time");
    assert_eq!(details["creditsRefunded"], 1);
    assert_eq!(details["penalty"], "None");
    let hours = details["hoursUntilClass"].as_f64().unwrap();
    assert!(hours > 28. && hours <= 30., "hours until class: {hours}");
    assert!(details["classDateTime"].is_string());
    assert!(details["cancelledAt"].is_string());
    assert_eq!(studio.credits(&ann), 2);
    assert_eq!(studio.confirmed_count(class_id), 0);
}

#[test]
fn late_cancellation_forfeits_credit() {
    let studio = Studio::new();
    let class_id = studio.class_in(10, 5);
    let ann = studio.student("ann@studio.test", 1);
    let booking_id = booked(&studio, &ann, class_id);

    let (status, body) = studio.cancel(&ann.cookie, booking_id);
    assert_eq!(status, Status::Ok, "cancel: {body}");
    assert_eq!(body["booking"]["status"], "late_cancel");
    assert_eq!(body["cancellationDetails"]["cancellationType"], "late");
    assert_eq!(body["cancellationDetails"]["creditsRefunded"], 0);
    assert_eq!(body["cancellationDetails"]["penalty"], "Credit forfeited");
    assert_eq!(studio.credits(&ann), 0);

    // terminal bookings stay as they are
    let (status, body) = studio.cancel(&ann.cookie, booking_id);
    assert_eq!(status, Status::BadRequest);
    assert_eq!(body["code"], "ALREADY_CANCELLED");
    assert_eq!(studio.credits(&ann), 0);
}

#[test]
fn cancellation_after_start_is_no_show() {
    let studio = Studio::new();
    let class_id = studio.class_in(-2, 5);
    let ann = studio.student("ann@studio.test", 1);
    let booking_id = booked(&studio, &ann, class_id);

    let (status, body) = studio.cancel(&ann.cookie, booking_id);
    assert_eq!(status, Status::Ok, "cancel: {body}");
    assert_eq!(body["booking"]["status"], "no_show");
    assert_eq!(body["cancellationDetails"]["cancellationType"], "no_show");
    assert_eq!(body["cancellationDetails"]["creditsRefunded"], 0);
    assert!(body["cancellationDetails"]["hoursUntilClass"].as_f64().unwrap() < 0.);
    assert_eq!(studio.credits(&ann), 0);

    let (status, body) = studio.cancel(&ann.cookie, booking_id);
    assert_eq!(status, Status::BadRequest);
    assert_eq!(body["code"], "INVALID_BOOKING_STATUS");
}

#[test]
fn second_booking_of_same_class_is_duplicate() {
    let studio = Studio::new();
    let class_id = studio.class_in(48, 5);
    let ann = studio.student("ann@studio.test", 3);
    booked(&studio, &ann, class_id);

    let (status, body) = studio.book(&ann, class_id);
    assert_eq!(status, Status::Conflict);
    assert_eq!(body["code"], "DUPLICATE_BOOKING");
    assert_eq!(studio.credits(&ann), 2);
    assert_eq!(studio.confirmed_count(class_id), 1);
}

#[test]
fn freed_seat_notifies_waitlist_without_booking() {
    let studio = Studio::new();
    let class_id = studio.class_in(48, 1);
    let ann = studio.student("ann@studio.test", 1);
    let bob = studio.student("bob@studio.test", 1);
    let booking_id = booked(&studio, &ann, class_id);

    let (status, body) = studio.post(&bob.cookie, "/api/waitlist", json!({"classId": class_id}));
    assert_eq!(status, Status::Ok, "waitlist: {body}");
    assert_eq!(body["position"], 1);
    let (_, waitlist) = studio.get(&bob.cookie, "/api/waitlist");
    assert_eq!(waitlist[0]["notified"], false);

    let (status, _) = studio.cancel(&ann.cookie, booking_id);
    assert_eq!(status, Status::Ok);

    let (_, waitlist) = studio.get(&bob.cookie, "/api/waitlist");
    assert_eq!(waitlist.as_array().unwrap().len(), 1);
    assert_eq!(waitlist[0]["classSessionId"], class_id);
    assert_eq!(waitlist[0]["position"], 1);
    assert_eq!(waitlist[0]["notified"], true);
    let (_, bookings) = studio.get(&bob.cookie, "/api/bookings");
    assert!(bookings.as_array().unwrap().is_empty());
    assert_eq!(studio.confirmed_count(class_id), 0);
    assert_eq!(studio.credits(&bob), 1);
}

#[test]
fn waitlist_join_rules() {
    let studio = Studio::new();
    let class_id = studio.class_in(48, 1);
    let ann = studio.student("ann@studio.test", 1);
    let bob = studio.student("bob@studio.test", 0);
    let cid = studio.student("cid@studio.test", 0);

    let (status, body) = studio.post(&bob.cookie, "/api/waitlist", json!({"classId": class_id}));
    assert_eq!(status, Status::Conflict);
    assert_eq!(body["code"], "CLASS_NOT_FULL");

    booked(&studio, &ann, class_id);
    let (status, body) = studio.post(&ann.cookie, "/api/waitlist", json!({"classId": class_id}));
    assert_eq!(status, Status::Conflict);
    assert_eq!(body["code"], "DUPLICATE_BOOKING");

    let (_, body) = studio.post(&bob.cookie, "/api/waitlist", json!({"classId": class_id}));
    assert_eq!(body["position"], 1);
    let (_, body) = studio.post(&cid.cookie, "/api/waitlist", json!({"classId": class_id}));
    assert_eq!(body["position"], 2);
    let (status, body) = studio.post(&bob.cookie, "/api/waitlist", json!({"classId": class_id}));
    assert_eq!(status, Status::Conflict);
    assert_eq!(body["code"], "ALREADY_ON_WAITLIST");

    let (status, body) = studio.post(&bob.cookie, "/api/waitlist", json!({"classId": 9999}));
    assert_eq!(status, Status::NotFound);
    assert_eq!(body["code"], "CLASS_NOT_FOUND");
}

#[test]
fn insufficient_credits_leave_no_booking() {
    let studio = Studio::new();
    let class_id = studio.class_in(48, 5);
    let ann = studio.student("ann@studio.test", 1);

    let (status, body) = studio.post(&ann.cookie, "/api/bookings", json!({"classId": class_id, "creditsUsed": 2}));
    assert_eq!(status, Status::BadRequest);
    assert_eq!(body["code"], "INSUFFICIENT_CREDITS");
    assert_eq!(studio.credits(&ann), 1);
    assert_eq!(studio.confirmed_count(class_id), 0);

    let bob = studio.student("bob@studio.test", 0);
    let (status, body) = studio.book(&bob, class_id);
    assert_eq!(status, Status::BadRequest);
    assert_eq!(body["code"], "INSUFFICIENT_CREDITS");
}

#[test]
fn free_day_class_costs_nothing() {
    let studio = Studio::new();
    let class_id = studio.create_class(FREE_DAY, "10:00:00", "11:00:00", 5);
    let ann = studio.student("ann@studio.test", 0);

    let (status, body) = studio.book(&ann, class_id);
    assert_eq!(status, Status::Created, "booking: {body}");
    assert_eq!(body["booking"]["creditsUsed"], 0);

    // nothing to give back
    let booking_id = body["booking"]["id"].as_i64().unwrap();
    let (status, body) = studio.cancel(&ann.cookie, booking_id);
    assert_eq!(status, Status::Ok);
    assert_eq!(body["cancellationDetails"]["creditsRefunded"], 0);
    assert_eq!(studio.credits(&ann), 0);
}

#[test]
fn booking_request_errors() {
    let studio = Studio::new();
    let ann = studio.student("ann@studio.test", 1);

    let (status, body) = studio.post(&ann.cookie, "/api/bookings", json!({}));
    assert_eq!(status, Status::BadRequest);
    assert_eq!(body["code"], "MISSING_CLASS_ID");
    let (status, body) = studio.post(&ann.cookie, "/api/bookings", json!({"classId": "yoga"}));
    assert_eq!(status, Status::BadRequest);
    assert_eq!(body["code"], "INVALID_CLASS_ID");
    let (status, body) = studio.post(&ann.cookie, "/api/bookings", json!({"classId": 4242}));
    assert_eq!(status, Status::NotFound);
    assert_eq!(body["code"], "CLASS_NOT_FOUND");

    let resp = studio.client.post("/api/bookings")
        .header(ContentType::JSON)
        .body(json!({"classId": 1}).to_string())
        .dispatch();
    assert_eq!(resp.status(), Status::Unauthorized);
    assert_eq!(resp.into_json::<Value>().unwrap()["code"], "UNAUTHORIZED");
}

#[test]
fn cancel_request_errors() {
    let studio = Studio::new();
    let class_id = studio.class_in(48, 5);
    let ann = studio.student("ann@studio.test", 1);
    let bob = studio.student("bob@studio.test", 0);
    let booking_id = booked(&studio, &ann, class_id);

    let (status, body) = studio.post(&ann.cookie, "/api/bookings/abc/cancel", json!({}));
    assert_eq!(status, Status::BadRequest);
    assert_eq!(body["code"], "INVALID_ID");
    let (status, body) = studio.cancel(&ann.cookie, 777);
    assert_eq!(status, Status::NotFound);
    assert_eq!(body["code"], "BOOKING_NOT_FOUND");
    let (status, body) = studio.cancel(&bob.cookie, booking_id);
    assert_eq!(status, Status::Forbidden);
    assert_eq!(body["code"], "FORBIDDEN");

    let resp = studio.client.post(format!("/api/bookings/{booking_id}/cancel")).dispatch();
    assert_eq!(resp.status(), Status::Unauthorized);
    assert_eq!(resp.into_json::<Value>().unwrap()["code"], "UNAUTHORIZED");

    // admins may cancel any booking
    let (status, body) = studio.cancel(&studio.admin, booking_id);
    assert_eq!(status, Status::Ok);
    assert_eq!(body["booking"]["status"], "cancelled");
    assert_eq!(studio.credits(&ann), 1);

    // the state of somebody else's booking stays hidden
    let (status, body) = studio.cancel(&bob.cookie, booking_id);
    assert_eq!(status, Status::Forbidden);
    assert_eq!(body["code"], "FORBIDDEN");
}

#[test]
fn cancel_is_rate_limited() {
    let studio = Studio::new();
    let ann = studio.student("ann@studio.test", 0);
    for _ in 0..CANCEL_RATE_LIMIT {
        let (status, _) = studio.cancel(&ann.cookie, 1000);
        assert_eq!(status, Status::NotFound);
    }
    let resp = studio.client.post("/api/bookings/1000/cancel")
        .private_cookie(ann.cookie.clone())
        .dispatch();
    assert_eq!(resp.status(), Status::TooManyRequests);
    assert_eq!(resp.headers().get_one("X-RateLimit-Limit"), Some(CANCEL_RATE_LIMIT.to_string().as_str()));
    assert_eq!(resp.headers().get_one("X-RateLimit-Remaining"), Some("0"));
    assert!(resp.headers().get_one("X-RateLimit-Reset").is_some());
    let retry_after = resp.headers().get_one("Retry-After").unwrap().parse::<u64>().unwrap();
    assert!(retry_after > 0 && retry_after <= 60);
    let body = resp.into_json::<Value>().unwrap();
    assert_eq!(body["code"], "RATE_LIMIT_EXCEEDED");
    assert!(body["retryAfter"].is_u64());
    assert!(body["resetTime"].is_string());

    // another client is not affected
    let bob = studio.student("bob@studio.test", 0);
    let (status, _) = studio.cancel(&bob.cookie, 1000);
    assert_eq!(status, Status::NotFound);
}

#[test]
fn capacity_cannot_drop_below_bookings() {
    let studio = Studio::new();
    let class_id = studio.class_in(48, 2);
    let ann = studio.student("ann@studio.test", 1);
    let bob = studio.student("bob@studio.test", 1);
    booked(&studio, &ann, class_id);
    booked(&studio, &bob, class_id);

    let (status, body) = studio.post(&studio.admin, &format!("/api/admin/classes/{class_id}"), json!({"capacity": 1}));
    assert_eq!(status, Status::Conflict);
    assert_eq!(body["code"], "CAPACITY_BELOW_BOOKINGS");

    let (status, body) = studio.post(&studio.admin, &format!("/api/admin/classes/{class_id}"), json!({"capacity": 3}));
    assert_eq!(status, Status::Ok, "update: {body}");
    assert_eq!(body["capacity"], 3);

    let (status, body) = studio.post(&ann.cookie, &format!("/api/admin/classes/{class_id}"), json!({"capacity": 10}));
    assert_eq!(status, Status::Forbidden);
    assert_eq!(body["code"], "FORBIDDEN");
}

#[test]
fn cancelled_class_refunds_everybody() {
    let studio = Studio::new();
    // inside the late window, a studio cancellation refunds anyway
    let class_id = studio.class_in(5, 5);
    let ann = studio.student("ann@studio.test", 1);
    let bob = studio.student("bob@studio.test", 1);
    booked(&studio, &ann, class_id);
    booked(&studio, &bob, class_id);

    let (status, body) = studio.post(&studio.admin, &format!("/api/admin/classes/{class_id}/cancel"), json!({}));
    assert_eq!(status, Status::Ok, "class cancel: {body}");
    assert_eq!(body["bookingsCancelled"], 2);
    assert_eq!(body["creditsRefunded"], 2);
    assert_eq!(body["class"]["status"], "cancelled");
    assert_eq!(studio.credits(&ann), 1);
    assert_eq!(studio.credits(&bob), 1);

    let (_, bookings) = studio.get(&ann.cookie, "/api/bookings");
    assert_eq!(bookings[0]["status"], "cancelled");
    assert_eq!(bookings[0]["cancellationType"], "on_time");

    let carl = studio.student("carl@studio.test", 1);
    let (status, body) = studio.book(&carl, class_id);
    assert_eq!(status, Status::Conflict);
    assert_eq!(body["code"], "CLASS_NOT_BOOKABLE");
}

#[test]
fn purchase_creates_expiring_lot() {
    let studio = Studio::new();
    let ann = studio.student("ann@studio.test", 0);
    let (status, package) = studio.post(&studio.admin, "/api/admin/packages", json!({"name": "5 pack", "credits": 5, "priceCents": 11000, "validityDays": 60}));
    assert_eq!(status, Status::Ok);
    let package_id = package["id"].as_i64().unwrap();

    let (status, packages) = studio.get(&ann.cookie, "/api/packages");
    assert_eq!(status, Status::Ok);
    assert_eq!(packages.as_array().unwrap().len(), 1);

    let (status, lot) = studio.post(&studio.admin, &format!("/api/admin/students/{}/purchases", ann.id), json!({"packageId": package_id}));
    assert_eq!(status, Status::Ok, "purchase: {lot}");
    assert_eq!(lot["creditsRemaining"], 5);
    assert_eq!(lot["packageId"], package_id);
    assert!(lot["expiresAt"].is_string());
    assert_eq!(studio.credits(&ann), 5);

    let (status, _) = studio.post(&ann.cookie, &format!("/api/admin/students/{}/purchases", ann.id), json!({"packageId": package_id}));
    assert_eq!(status, Status::Forbidden);
}

#[test]
fn stored_policy_changes_classification() {
    let studio = Studio::new();
    let (status, policy) = studio.post(&studio.admin, "/api/admin/policy", json!({
        "cancellationWindowHours": 2,
        "lateCancelPenalty": "Half credit",
        "noShowPenalty": "Full credit",
    }));
    assert_eq!(status, Status::Ok, "policy: {policy}");
    let class_id = studio.class_in(10, 5);
    let ann = studio.student("ann@studio.test", 1);
    let booking_id = booked(&studio, &ann, class_id);

    let (status, body) = studio.cancel(&ann.cookie, booking_id);
    assert_eq!(status, Status::Ok);
    assert_eq!(body["cancellationDetails"]["cancellationType"], "on_time");
    assert_eq!(studio.credits(&ann), 1);
}

#[test]
fn roster_lists_bookings() {
    let studio = Studio::new();
    let class_id = studio.class_in(48, 5);
    let ann = studio.student("ann@studio.test", 1);
    booked(&studio, &ann, class_id);

    let (status, roster) = studio.get(&studio.admin, &format!("/api/admin/classes/{class_id}/roster"));
    assert_eq!(status, Status::Ok);
    assert_eq!(roster[0]["studentEmail"], "ann@studio.test");
    assert_eq!(roster[0]["status"], "confirmed");

    let resp = studio.client.get(format!("/api/admin/classes/{class_id}/roster.csv"))
        .private_cookie(studio.admin.clone())
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    assert_eq!(resp.content_type(), Some(ContentType::CSV));
    let csv = resp.into_string().unwrap();
    assert_eq!(csv.lines().count(), 2);
    assert!(csv.contains("ann@studio.test,confirmed"));

    let (status, _) = studio.get(&ann.cookie, &format!("/api/admin/classes/{class_id}/roster"));
    assert_eq!(status, Status::Forbidden);
}

#[test]
fn pages_render() {
    let studio = Studio::new();
    let class_id = studio.class_in(48, 5);
    let resp = studio.client.get("/").dispatch();
    assert_eq!(resp.status(), Status::Ok);
    assert!(resp.into_string().unwrap().contains("Reformer"));

    let ann = studio.student("ann@studio.test", 1);
    booked(&studio, &ann, class_id);
    let resp = studio.client.get("/bookings").private_cookie(ann.cookie.clone()).dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let resp = studio.client.get(format!("/admin/class/{class_id}")).private_cookie(studio.admin.clone()).dispatch();
    assert_eq!(resp.status(), Status::Ok);
    assert!(resp.into_string().unwrap().contains("ann@studio.test"));
}

fn waitlist_flags(studio: &Studio, waiters: &[Student], class_id: i64) -> Vec<bool> {
    waiters.iter().map(|waiter| {
        let (status, waitlist) = studio.get(&waiter.cookie, "/api/waitlist");
        assert_eq!(status, Status::Ok);
        let entry = waitlist.as_array().unwrap().iter()
            .find(|entry| entry["classSessionId"] == class_id)
            .unwrap();
        entry["notified"].as_bool().unwrap()
    }).collect()
}

#[test]
fn freed_seat_notifies_first_five_waiting() {
    let studio = Studio::new();
    let class_id = studio.class_in(48, 2);
    let ann = studio.student("ann@studio.test", 1);
    let bob = studio.student("bob@studio.test", 1);
    let ann_booking = booked(&studio, &ann, class_id);
    let bob_booking = booked(&studio, &bob, class_id);

    let waiters: Vec<Student> = (1..=7)
        .map(|n| studio.student(&format!("waiter{n}@studio.test"), if n == 6 { 1 } else { 0 }))
        .collect();
    for (n, waiter) in waiters.iter().enumerate() {
        let (status, body) = studio.post(&waiter.cookie, "/api/waitlist", json!({"classId": class_id}));
        assert_eq!(status, Status::Ok, "waitlist: {body}");
        assert_eq!(body["position"], n as i64 + 1);
    }

    let (status, _) = studio.cancel(&ann.cookie, ann_booking);
    assert_eq!(status, Status::Ok);
    assert_eq!(waitlist_flags(&studio, &waiters, class_id), [true, true, true, true, true, false, false]);

    // the sixth takes the seat before being told about it
    booked(&studio, &waiters[5], class_id);
    assert_eq!(studio.confirmed_count(class_id), 2);

    let (status, _) = studio.cancel(&bob.cookie, bob_booking);
    assert_eq!(status, Status::Ok);
    assert_eq!(waitlist_flags(&studio, &waiters, class_id), [true, true, true, true, true, false, true]);
    assert_eq!(studio.confirmed_count(class_id), 1);
}

#[test]
fn cancel_succeeds_when_refund_has_no_lot() {
    let studio = Studio::new();
    let class_id = studio.class_in(48, 5);
    let ann = studio.student("ann@studio.test", 0);
    let expires_at = (Utc::now() + TimeDelta::seconds(2)).to_rfc3339();
    let (status, lot) = studio.post(&studio.admin, &format!("/api/admin/students/{}/credits", ann.id), json!({"credits": 1, "expiresAt": expires_at}));
    assert_eq!(status, Status::Ok, "grant: {lot}");
    let booking_id = booked(&studio, &ann, class_id);

    std::thread::sleep(std::time::Duration::from_millis(2500));
    let (status, body) = studio.cancel(&ann.cookie, booking_id);
    assert_eq!(status, Status::Ok, "cancel: {body}");
    assert_eq!(body["booking"]["status"], "cancelled");
    assert_eq!(body["cancellationDetails"]["cancellationType"], "on_time");
    assert_eq!(body["cancellationDetails"]["creditsRefunded"], 0);
    assert_eq!(studio.credits(&ann), 0);
}

mod concurrent {
    use rocket::futures::future::join_all;
    use rocket::local::asynchronous::Client;
    use super::*;

    async fn login(client: &Client, email: &str) -> Cookie<'static> {
        let resp = client.get(format!("/login/dev?email={email}")).dispatch().await;
        assert_eq!(resp.status(), Status::SeeOther);
        resp.cookies().get_private(STUDIO_SESSION_ID).expect("session cookie")
    }

    async fn post(client: &Client, cookie: &Cookie<'static>, url: &str, body: Value) -> (Status, Value) {
        let resp = client.post(url.to_string())
            .private_cookie(cookie.clone())
            .header(ContentType::JSON)
            .body(body.to_string())
            .dispatch().await;
        let status = resp.status();
        (status, resp.into_json::<Value>().await.unwrap_or(Value::Null))
    }

    async fn student(client: &Client, admin: &Cookie<'static>, email: &str, credits: i64) -> Cookie<'static> {
        let cookie = login(client, email).await;
        let me = client.get("/api/me").private_cookie(cookie.clone()).dispatch().await
            .into_json::<Value>().await.unwrap();
        let id = me["id"].as_i64().unwrap();
        let (status, _) = post(client, admin, &format!("/api/admin/students/{id}/credits"), json!({"credits": credits})).await;
        assert_eq!(status, Status::Ok);
        cookie
    }

    async fn studio_with_class(capacity: i64) -> (Client, Cookie<'static>, i64) {
        let client = Client::untracked(crate::build_rocket(test_figment())).await.unwrap();
        let admin = login(&client, ADMIN_EMAIL).await;
        let (_, class_type) = post(&client, &admin, "/api/admin/class-types", json!({"name": "Reformer", "durationMinutes": 50})).await;
        let start = Utc::now() + TimeDelta::days(2);
        let (status, class) = post(&client, &admin, "/api/admin/classes", json!({
            "classTypeId": class_type["id"],
            "date": start.format("%F").to_string(),
            "startTime": "10:00:00",
            "endTime": "11:00:00",
            "capacity": capacity,
        })).await;
        assert_eq!(status, Status::Ok, "create class: {class}");
        let class_id = class["id"].as_i64().unwrap();
        (client, admin, class_id)
    }

    async fn confirmed_count(client: &Client, class_id: i64) -> i64 {
        let class = client.get(format!("/api/classes/{class_id}")).dispatch().await
            .into_json::<Value>().await.unwrap();
        class["confirmedCount"].as_i64().unwrap()
    }

    #[rocket::async_test]
    async fn simultaneous_bookings_never_overbook() {
        let (client, admin, class_id) = studio_with_class(1).await;
        let mut students = vec![];
        for n in 0..8 {
            students.push(student(&client, &admin, &format!("student{n}@studio.test"), 1).await);
        }

        let results = join_all(students.iter()
            .map(|cookie| post(&client, cookie, "/api/bookings", json!({"classId": class_id}))))
            .await;
        let created = results.iter().filter(|(status, _)| *status == Status::Created).count();
        assert_eq!(created, 1, "results: {results:?}");
        for (status, body) in results.iter().filter(|(status, _)| *status != Status::Created) {
            assert_eq!(*status, Status::Conflict);
            assert_eq!(body["code"], "CLASS_FULL");
        }
        assert_eq!(confirmed_count(&client, class_id).await, 1);
    }

    #[rocket::async_test]
    async fn simultaneous_bookings_of_one_student_book_once() {
        let (client, admin, class_id) = studio_with_class(5).await;
        let ann = student(&client, &admin, "ann@studio.test", 2).await;

        let results = join_all((0..2)
            .map(|_| post(&client, &ann, "/api/bookings", json!({"classId": class_id}))))
            .await;
        let created = results.iter().filter(|(status, _)| *status == Status::Created).count();
        assert_eq!(created, 1, "results: {results:?}");
        let duplicate = results.iter().find(|(status, _)| *status != Status::Created).unwrap();
        assert_eq!(duplicate.0, Status::Conflict);
        assert_eq!(duplicate.1["code"], "DUPLICATE_BOOKING");
        assert_eq!(confirmed_count(&client, class_id).await, 1);

        let credits = client.get("/api/credits").private_cookie(ann.clone()).dispatch().await
            .into_json::<Value>().await.unwrap();
        assert_eq!(credits["available"], 1);
    }
}
