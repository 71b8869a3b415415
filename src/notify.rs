use std::sync::Arc;
use std::time::Duration;
use anyhow::anyhow;
use async_broadcast::{InactiveReceiver, Receiver, RecvError, Sender, TrySendError};
use chrono::{NaiveDate, NaiveTime};
use log::{debug, error, info, warn};
use rocket::response::stream::{Event, EventStream};
use rocket::{Build, Rocket, State};
use serde::{Deserialize, Serialize};
use crate::auth::user_info;
use crate::bookings::CancellationType;
use crate::error::ApiError;
use crate::{StudioSessionId, SharedStudioState};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub name: String,
    pub email: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClassSlot {
    pub class_session_id: i64,
    pub class_name: String,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub instructor: Option<Contact>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BookingNotice {
    pub booking_id: i64,
    pub student: Contact,
    pub class: ClassSlot,
    pub credits_used: i64,
    pub credits_remaining: i64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CancellationNotice {
    pub booking_id: i64,
    pub student: Contact,
    pub class: ClassSlot,
    pub cancellation_type: CancellationType,
    pub penalty: String,
    pub credits_refunded: i64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WaitlistNotice {
    pub student: Contact,
    pub class: ClassSlot,
    pub position: i64,
    pub spots_available: i64,
}

/// Studio events announced after the unit of work that produced them committed.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum Notification {
    BookingCreated(BookingNotice),
    Cancellation(CancellationNotice),
    WaitlistSeatOpen(WaitlistNotice),
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct OutgoingMail {
    pub to: String,
    pub subject: String,
    pub text: String,
}

fn class_line(class: &ClassSlot) -> String {
    let mut s = format!("{} on {} at {}", class.class_name, class.date.format("%a %F"), class.start_time.format("%H:%M"));
    if let Some(instructor) = &class.instructor {
        s.push_str(&format!(" with {}", instructor.name));
    }
    s
}

impl Notification {
    pub fn mails(&self) -> Vec<OutgoingMail> {
        match self {
            Notification::BookingCreated(n) => {
                let mut mails = vec![OutgoingMail {
                    to: n.student.email.clone(),
                    subject: format!("Booking confirmed: {}", n.class.class_name),
                    text: format!("Hi {},\n\nyour place in {} is confirmed.\nCredits used: {}, credits remaining: {}.\n",
                                  n.student.name, class_line(&n.class), n.credits_used, n.credits_remaining),
                }];
                if let Some(instructor) = &n.class.instructor {
                    mails.push(OutgoingMail {
                        to: instructor.email.clone(),
                        subject: format!("New booking: {}", n.class.class_name),
                        text: format!("{} booked {}.\n", n.student.name, class_line(&n.class)),
                    });
                }
                mails
            }
            Notification::Cancellation(n) => {
                let outcome = match n.cancellation_type {
                    CancellationType::OnTime => format!("{} credit(s) were returned to your account.", n.credits_refunded),
                    CancellationType::Late | CancellationType::NoShow => format!("Penalty: {}.", n.penalty),
                };
                let mut mails = vec![OutgoingMail {
                    to: n.student.email.clone(),
                    subject: format!("Booking cancelled: {}", n.class.class_name),
                    text: format!("Hi {},\n\nyour booking of {} was cancelled ({}).\n{outcome}\n",
                                  n.student.name, class_line(&n.class), n.cancellation_type),
                }];
                if let Some(instructor) = &n.class.instructor {
                    mails.push(OutgoingMail {
                        to: instructor.email.clone(),
                        subject: format!("Cancellation: {}", n.class.class_name),
                        text: format!("{} cancelled {} ({}).\n", n.student.name, class_line(&n.class), n.cancellation_type),
                    });
                }
                mails
            }
            Notification::WaitlistSeatOpen(n) => vec![OutgoingMail {
                to: n.student.email.clone(),
                subject: format!("A spot opened up: {}", n.class.class_name),
                text: format!("Hi {},\n\n{} spot(s) opened up in {}.\nYou are number {} on the waitlist, book now to take the spot, first come first served.\n",
                              n.student.name, n.spots_available, class_line(&n.class), n.position),
            }],
        }
    }
}

#[rocket::async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, mail: &OutgoingMail) -> anyhow::Result<()>;
}

/// Mailer used when no email provider is configured.
pub struct LogMailer;
#[rocket::async_trait]
impl Mailer for LogMailer {
    async fn send(&self, mail: &OutgoingMail) -> anyhow::Result<()> {
        info!("Mail to: {}, subject: {}", mail.to, mail.subject);
        Ok(())
    }
}

/// Posts mails to a transactional email provider JSON API.
pub struct HttpMailer {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    from: String,
}
impl HttpMailer {
    pub fn new(api_url: &str, api_key: &str, from: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            api_url: api_url.to_string(),
            api_key: api_key.to_string(),
            from: from.to_string(),
        })
    }
}
#[rocket::async_trait]
impl Mailer for HttpMailer {
    async fn send(&self, mail: &OutgoingMail) -> anyhow::Result<()> {
        let body = serde_json::json!({
            "from": self.from,
            "to": [mail.to],
            "subject": mail.subject,
            "text": mail.text,
        });
        let response = self.client.post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("Mail provider returned {status}: {text}"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}
impl Default for RetryPolicy {
    fn default() -> Self {
        Self { attempts: 3, backoff: Duration::from_secs(2) }
    }
}

async fn deliver(mail: &OutgoingMail, mailer: &dyn Mailer, retry: &RetryPolicy) -> anyhow::Result<()> {
    let mut attempt = 1;
    loop {
        match mailer.send(mail).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < retry.attempts => {
                warn!("Mail to {} failed, attempt: {attempt}, error: {e}", mail.to);
                rocket::tokio::time::sleep(retry.backoff * attempt).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Sends every mail of a notification, a failed mail never stops the others.
pub async fn dispatch(notification: &Notification, mailer: &dyn Mailer, retry: &RetryPolicy) -> usize {
    let mut delivered = 0;
    for mail in notification.mails() {
        match deliver(&mail, mailer, retry).await {
            Ok(()) => delivered += 1,
            Err(e) => error!("Mail to {} with subject '{}' dropped: {e}", mail.to, mail.subject),
        }
    }
    delivered
}

pub async fn run_dispatcher(mut receiver: Receiver<Notification>, mailer: Arc<dyn Mailer>, retry: RetryPolicy) {
    info!("Notification dispatcher started");
    loop {
        match receiver.recv().await {
            Ok(notification) => {
                dispatch(&notification, mailer.as_ref(), &retry).await;
            }
            Err(RecvError::Overflowed(n)) => {
                warn!("Notification dispatcher lagging, {n} notifications dropped");
            }
            Err(RecvError::Closed) => {
                info!("Notification channel closed, dispatcher exits");
                break;
            }
        }
    }
}

/// Broadcast channel between committed units of work and notification consumers.
pub struct NotificationHub {
    sender: Sender<Notification>,
    // keeps the channel open without holding messages
    receiver: InactiveReceiver<Notification>,
}
impl NotificationHub {
    pub fn new(capacity: usize) -> Self {
        let (mut sender, receiver) = async_broadcast::broadcast(capacity);
        // a slow consumer must never block a request
        sender.set_overflow(true);
        Self { sender, receiver: receiver.deactivate() }
    }
    pub fn subscribe(&self) -> Receiver<Notification> {
        self.receiver.activate_cloned()
    }
    /// Queues notifications for the subscribers, returns how many queued ones had to be dropped.
    pub fn publish(&self, notifications: Vec<Notification>) -> usize {
        let mut dropped_count = 0;
        for notification in notifications {
            match self.sender.try_broadcast(notification) {
                Ok(None) => {}
                Ok(Some(dropped)) => {
                    dropped_count += 1;
                    warn!("Notification queue full, oldest dropped: {dropped:?}");
                }
                Err(TrySendError::Inactive(n)) => debug!("No notification subscriber, not queued: {n:?}"),
                Err(TrySendError::Full(n)) | Err(TrySendError::Closed(n)) => {
                    error!("Notification not queued: {n:?}");
                }
            }
        }
        dropped_count
    }
}

#[get("/api/admin/notifications/sse")]
async fn notifications_sse(session_id: StudioSessionId, state: &State<SharedStudioState>, hub: &State<NotificationHub>) -> Result<EventStream![], ApiError> {
    user_info(&session_id, state).await?.require_admin()?;
    let mut receiver = hub.subscribe();
    Ok(EventStream! {
        loop {
            let notification = match receiver.recv().await {
                Ok(n) => n,
                Err(RecvError::Overflowed(n)) => {
                    warn!("Notification stream lagging, {n} skipped");
                    continue;
                }
                Err(e) => {
                    error!("Read notification error: {e}");
                    break;
                }
            };
            match serde_json::to_string(&notification) {
                Ok(json) => {
                    yield Event::data(json);
                }
                Err(e) => {
                    error!("Serde error: {e}");
                    break;
                }
            }
        }
    })
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
        notifications_sse,
    ])
}
