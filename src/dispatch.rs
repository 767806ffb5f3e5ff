//! Dispatcher: email in, queued command out, and the worker's report back.
//!
//! Admission order:
//! 1. Parse (never fails)
//! 2. Reject self-sent mail, missing sender, non-whitelisted sender,
//!    empty command, already-seen `Message-ID`
//! 3. Rate limit, last, so rejected mail never consumes quota
//! 4. Enqueue

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::QueueError;
use crate::parser::{EmailParser, normalize_address, sender_address};
use crate::queue::{CommandQueue, CommandStatus};
use crate::rate_limit::RateLimiter;

/// What happened to an inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Admission {
    /// Enqueued as a new pending command.
    Queued { id: i64 },
    /// Sent from our own mailbox (e.g. a reply we sent).
    SelfSent,
    MissingSender,
    NotWhitelisted { sender: String },
    EmptyCommand { sender: String },
    /// This `Message-ID` has already been queued.
    Duplicate { existing_id: i64 },
    RateLimited { sender: String },
}

impl Admission {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Queued { .. } => "queued",
            Self::SelfSent => "self_sent",
            Self::MissingSender => "missing_sender",
            Self::NotWhitelisted { .. } => "not_whitelisted",
            Self::EmptyCommand { .. } => "empty_command",
            Self::Duplicate { .. } => "duplicate",
            Self::RateLimited { .. } => "rate_limited",
        }
    }

    pub fn queued_id(&self) -> Option<i64> {
        match self {
            Self::Queued { id } => Some(*id),
            _ => None,
        }
    }
}

/// Result of reporting a failed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RetryOutcome {
    /// Back in the queue; `attempt` is the retry count so far.
    Requeued { attempt: u32 },
    /// Out of retries; the command is now `failed`.
    Exhausted { attempts: u32 },
    NotFound,
}

pub struct Dispatcher {
    parser: EmailParser,
    limiter: RateLimiter,
    queue: Arc<CommandQueue>,
    own_address: Option<String>,
}

impl Dispatcher {
    pub fn new(parser: EmailParser, limiter: RateLimiter, queue: Arc<CommandQueue>) -> Self {
        Self {
            parser,
            limiter,
            queue,
            own_address: None,
        }
    }

    /// Build from loaded settings. The mailbox account, if any, is treated
    /// as our own address.
    pub fn from_settings(settings: &Settings, queue: Arc<CommandQueue>) -> Self {
        let dispatcher = Self::new(
            EmailParser::new(&settings.whitelist),
            RateLimiter::new(settings.rate_limit),
            queue,
        );
        match &settings.mailbox {
            Some(mailbox) => dispatcher.with_own_address(&mailbox.username),
            None => dispatcher,
        }
    }

    /// Open the queue described by `settings` and dispatch into it. Rate
    /// windows are rebuilt from commands accepted within the last window.
    pub async fn open(settings: &Settings) -> crate::error::Result<Self> {
        let queue = CommandQueue::open(&settings.queue).await?;
        let dispatcher = Self::from_settings(settings, Arc::new(queue));
        dispatcher.load_rate_windows().await?;
        Ok(dispatcher)
    }

    /// Count every command accepted inside the current window against its
    /// sender. Returns how many were loaded.
    pub async fn load_rate_windows(&self) -> Result<usize, QueueError> {
        let accepted = self
            .queue
            .accepted_since(self.limiter.window_start())
            .await?;
        for (sender, at) in &accepted {
            self.limiter.seed(sender, *at);
        }
        debug!(loaded = accepted.len(), "Rate windows restored from queue");
        Ok(accepted.len())
    }

    /// Drop mail whose sender is `address`.
    pub fn with_own_address(mut self, address: &str) -> Self {
        let address = normalize_address(&sender_address(address));
        self.own_address = (!address.is_empty()).then_some(address);
        self
    }

    pub fn parser(&self) -> &EmailParser {
        &self.parser
    }

    pub fn parser_mut(&mut self) -> &mut EmailParser {
        &mut self.parser
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn queue(&self) -> &Arc<CommandQueue> {
        &self.queue
    }

    /// Parse a raw message and enqueue it if it passes every check.
    pub async fn admit(&self, raw: &[u8]) -> Result<Admission, QueueError> {
        let email = self.parser.parse_email(raw);

        let admission = if self.own_address.as_deref() == Some(email.sender.as_str()) {
            Admission::SelfSent
        } else if email.sender.is_empty() {
            Admission::MissingSender
        } else if !email.is_whitelisted {
            Admission::NotWhitelisted {
                sender: email.sender.clone(),
            }
        } else if email.command.is_empty() {
            Admission::EmptyCommand {
                sender: email.sender.clone(),
            }
        } else if let Some(existing) = self.find_duplicate(email.message_id.as_deref()).await? {
            Admission::Duplicate {
                existing_id: existing,
            }
        } else if !self.limiter.is_allowed(&email.sender) {
            Admission::RateLimited {
                sender: email.sender.clone(),
            }
        } else {
            let subject = (!email.subject.is_empty()).then_some(email.subject.as_str());
            match self
                .queue
                .enqueue(
                    &email.sender,
                    &email.command,
                    email.message_id.as_deref(),
                    subject,
                )
                .await
            {
                Ok(id) => {
                    info!(id, sender = %email.sender, "Command queued");
                    return Ok(Admission::Queued { id });
                }
                // Another process queued the same Message-ID after our lookup.
                Err(QueueError::DuplicateMessage { message_id }) => {
                    match self.find_duplicate(Some(&message_id)).await? {
                        Some(existing_id) => Admission::Duplicate { existing_id },
                        None => return Err(QueueError::DuplicateMessage { message_id }),
                    }
                }
                Err(e) => return Err(e),
            }
        };

        warn!(
            sender = %email.sender,
            message_id = email.message_id.as_deref().unwrap_or("-"),
            outcome = admission.label(),
            "Email rejected"
        );
        Ok(admission)
    }

    async fn find_duplicate(&self, message_id: Option<&str>) -> Result<Option<i64>, QueueError> {
        let Some(message_id) = message_id else {
            return Ok(None);
        };
        Ok(self
            .queue
            .find_by_message_id(message_id)
            .await?
            .map(|cmd| cmd.id))
    }

    /// Record a successful execution.
    pub async fn complete(&self, id: i64, result: &str) -> Result<bool, QueueError> {
        self.queue
            .update_status(id, CommandStatus::Completed, Some(result), None)
            .await
    }

    /// Record a failed execution of a claimed command: requeue while
    /// retries remain, otherwise mark it `failed`. The error is kept either
    /// way. Reporting against a command that is not `processing` changes
    /// nothing and returns `InvalidTransition`.
    pub async fn fail(
        &self,
        id: i64,
        error: &str,
        max_retries: u32,
    ) -> Result<RetryOutcome, QueueError> {
        let Some(cmd) = self.queue.record_failure(id, error, max_retries).await? else {
            return Ok(RetryOutcome::NotFound);
        };

        let attempt = cmd.retry_count;
        if cmd.status == CommandStatus::Pending {
            warn!(id, attempt, max_retries, error, "Command failed, requeued");
            Ok(RetryOutcome::Requeued { attempt })
        } else {
            warn!(id, attempts = attempt, error, "Command failed, retries exhausted");
            Ok(RetryOutcome::Exhausted { attempts: attempt })
        }
    }
}
