//! Send emails to user out of the request cycle.
//!
//! Jobs are pushed on a bounded queue and consumed by a pool of workers.
//! Every job is retried until delivered or `max_attempts` is reached, so an
//! email may be sent more than once.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc};

use crate::config::Mail;
use crate::user::UserRepository;

const DEFAULT_WORKERS: usize = 2;
const DEFAULT_QUEUE_SIZE: usize = 256;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(thiserror::Error, Debug)]
pub enum MailError {
    #[error("invalid address: {0}")]
    Address(#[from] lettre::address::AddressError),
    #[error("cannot build message: {0}")]
    Message(#[from] lettre::error::Error),
    #[error("smtp error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
    #[error("mail queue is closed")]
    Closed,
    #[error("mail queue is full")]
    Full,
}

/// Mail templates list.
#[derive(Debug)]
pub enum Template<'a> {
    /// Ask user to confirm their email address.
    Activation { name: &'a str, link: &'a str },
}

impl Template<'_> {
    pub fn subject(&self) -> &'static str {
        match self {
            Template::Activation { .. } => "Activate your account",
        }
    }

    pub fn render(&self) -> String {
        match self {
            Template::Activation { name, link } => format!(
                "Hi {name},\n\n\
                Please click on the link below to confirm your email address \
                and activate your account:\n\n\
                {link}\n\n\
                If you did not create an account, you can ignore this email.\n"
            ),
        }
    }
}

/// A rendered email, ready to be delivered.
#[derive(Clone, Debug, PartialEq)]
pub struct Email {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Way emails leave the process.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, email: &Email) -> Result<(), MailError>;
}

/// Deliver through an SMTP relay.
pub struct SmtpTransport {
    from: Mailbox,
    inner: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpTransport {
    /// Create a new [`SmtpTransport`].
    pub fn new(config: &Mail) -> Result<Self, MailError> {
        let mut builder = if config.tls.unwrap_or(true) {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
        };

        if let Some(port) = config.port {
            builder = builder.port(port);
        }

        if let Some((username, password)) =
            config.username.clone().zip(config.password.clone())
        {
            builder = builder.credentials(Credentials::new(username, password));
        }

        tracing::info!(host = %config.host, "smtp transport configured");

        Ok(Self {
            from: config.from.parse()?,
            inner: builder.build(),
        })
    }
}

#[async_trait]
impl Transport for SmtpTransport {
    async fn send(&self, email: &Email) -> Result<(), MailError> {
        let message = Message::builder()
            .from(self.from.clone())
            .to(email.to.parse()?)
            .subject(&email.subject)
            .header(ContentType::TEXT_PLAIN)
            .body(email.body.clone())?;

        self.inner.send(message).await?;
        Ok(())
    }
}

/// Write emails to the log instead of sending them.
pub struct LogTransport;

#[async_trait]
impl Transport for LogTransport {
    async fn send(&self, email: &Email) -> Result<(), MailError> {
        tracing::info!(
            to = %email.to,
            subject = %email.subject,
            body = %email.body,
            "no mail transport configured, email logged"
        );
        Ok(())
    }
}

/// Worker pool settings.
#[derive(Clone, Debug)]
pub struct Dispatch {
    pub workers: usize,
    pub queue_size: usize,
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for Dispatch {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            queue_size: DEFAULT_QUEUE_SIZE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl From<Option<&Mail>> for Dispatch {
    fn from(config: Option<&Mail>) -> Self {
        let default = Self::default();
        let Some(config) = config else {
            return default;
        };

        Self {
            workers: config.workers.unwrap_or(default.workers).max(1),
            queue_size: config.queue_size.unwrap_or(default.queue_size).max(1),
            max_attempts: config.max_attempts.unwrap_or(default.max_attempts).max(1),
            retry_delay: default.retry_delay,
        }
    }
}

#[derive(Debug)]
struct Job {
    user_id: i64,
    subject: String,
    body: String,
}

/// Mail queue handle.
#[derive(Clone)]
pub struct MailManager {
    sender: mpsc::Sender<Job>,
}

impl std::fmt::Debug for MailManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailManager")
            .field("capacity", &self.sender.capacity())
            .finish()
    }
}

impl MailManager {
    /// Spawn delivery workers and return a handle to feed them.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        users: Arc<dyn UserRepository>,
        transport: Arc<dyn Transport>,
        dispatch: Dispatch,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(dispatch.queue_size);
        let receiver = Arc::new(Mutex::new(receiver));

        for worker in 0..dispatch.workers {
            let receiver = Arc::clone(&receiver);
            let users = Arc::clone(&users);
            let transport = Arc::clone(&transport);
            let dispatch = dispatch.clone();

            tokio::spawn(async move {
                loop {
                    let job = receiver.lock().await.recv().await;
                    let Some(job) = job else {
                        tracing::debug!(worker, "mail queue closed, worker stopped");
                        break;
                    };

                    deliver(users.as_ref(), transport.as_ref(), &dispatch, job).await;
                }
            });
        }

        Self { sender }
    }

    /// Queue an email for `user_id`.
    ///
    /// Never waits: a full queue rejects the job. Delivery happens later.
    pub fn enqueue(
        &self,
        user_id: i64,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Result<(), MailError> {
        let job = Job {
            user_id,
            subject: subject.into(),
            body: body.into(),
        };

        if let Err(err) = self.sender.try_send(job) {
            metrics::counter!("mail_jobs_total", "outcome" => "rejected").increment(1);
            return Err(match err {
                TrySendError::Full(_) => MailError::Full,
                TrySendError::Closed(_) => MailError::Closed,
            });
        }

        metrics::counter!("mail_jobs_total", "outcome" => "queued").increment(1);
        Ok(())
    }
}

async fn deliver(
    users: &dyn UserRepository,
    transport: &dyn Transport,
    dispatch: &Dispatch,
    job: Job,
) {
    for attempt in 1..=dispatch.max_attempts {
        let error = match users.find_by_id(job.user_id).await {
            Ok(Some(user)) => {
                let email = Email {
                    to: user.email,
                    subject: job.subject.clone(),
                    body: job.body.clone(),
                };

                match transport.send(&email).await {
                    Ok(()) => {
                        tracing::debug!(user_id = job.user_id, attempt, "email sent");
                        metrics::counter!("mail_jobs_total", "outcome" => "sent")
                            .increment(1);
                        return;
                    },
                    Err(err) => err.to_string(),
                }
            },
            Ok(None) => {
                tracing::debug!(user_id = job.user_id, "user no longer exists, email dropped");
                metrics::counter!("mail_jobs_total", "outcome" => "dropped").increment(1);
                return;
            },
            Err(err) => err.to_string(),
        };

        tracing::warn!(user_id = job.user_id, attempt, %error, "email delivery failed");

        if attempt < dispatch.max_attempts {
            tokio::time::sleep(dispatch.retry_delay * attempt).await;
        }
    }

    tracing::error!(
        user_id = job.user_id,
        subject = %job.subject,
        "email not delivered after {} attempts",
        dispatch.max_attempts
    );
    metrics::counter!("mail_jobs_total", "outcome" => "failed").increment(1);
}

/// Never complete a delivery.
#[cfg(test)]
pub(crate) struct StalledTransport;

#[cfg(test)]
#[async_trait]
impl Transport for StalledTransport {
    async fn send(&self, _email: &Email) -> Result<(), MailError> {
        std::future::pending().await
    }
}

/// Keep every email in memory.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingTransport {
    sent: std::sync::Mutex<Vec<Email>>,
    failures: std::sync::atomic::AtomicU32,
}

#[cfg(test)]
impl RecordingTransport {
    /// Fail the next `count` deliveries.
    pub fn failing(count: u32) -> Self {
        Self {
            failures: count.into(),
            ..Default::default()
        }
    }

    pub fn sent(&self) -> Vec<Email> {
        self.sent.lock().unwrap().clone()
    }

    /// Wait until at least `count` emails were delivered.
    pub async fn wait_for(&self, count: usize) -> Vec<Email> {
        for _ in 0..200 {
            let sent = self.sent();
            if sent.len() >= count {
                return sent;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.sent()
    }
}

#[cfg(test)]
#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, email: &Email) -> Result<(), MailError> {
        use std::sync::atomic::Ordering;

        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(MailError::Closed);
        }

        self.sent.lock().unwrap().push(email.clone());
        Ok(())
    }
}
