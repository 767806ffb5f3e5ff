//! Configuration types.
//!
//! Everything is loaded once at startup into [`Settings`] and handed to the
//! components that need it. Nothing inside the core reads the environment.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Command queue storage configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// SQLite database file.
    pub db_path: PathBuf,
    /// Hold an exclusive `<db_path>.lock` for the lifetime of the queue.
    pub use_lock: bool,
    /// How long a statement waits on a locked database before failing.
    pub busy_timeout: Duration,
}

impl QueueConfig {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Self::default()
        }
    }

    /// Path of the advisory lock file co-located with the database.
    pub fn lock_path(&self) -> PathBuf {
        let mut name = self.db_path.as_os_str().to_os_string();
        name.push(".lock");
        PathBuf::from(name)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/commands.db"),
            use_lock: true,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// Sliding-window rate limit per sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Accepted requests allowed inside one window.
    pub max_requests: u32,
    /// Window length in hours.
    pub window_hours: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 30,
            window_hours: 1,
        }
    }
}

/// Command execution retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}

/// Mailbox connection settings, consumed by the IMAP/SMTP transport.
#[derive(Debug, Clone)]
pub struct MailboxConfig {
    pub imap_host: String,
    pub imap_port: u16,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: SecretString,
    pub poll_interval_secs: u64,
}

/// All runtime settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// `None` when no mailbox account is configured.
    pub mailbox: Option<MailboxConfig>,
    pub whitelist: Vec<String>,
    pub queue: QueueConfig,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
}

impl Settings {
    /// Build settings from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let whitelist = parse_list(&lookup("EMAIL_WHITELIST").unwrap_or_default());

        let mut queue = QueueConfig::default();
        if let Some(path) = get("QUEUE_DB_PATH") {
            queue.db_path = PathBuf::from(path);
        }
        if let Some(flag) = get("QUEUE_USE_LOCK") {
            queue.use_lock = parse_bool("QUEUE_USE_LOCK", &flag)?;
        }

        let defaults = RateLimitConfig::default();
        let rate_limit = RateLimitConfig {
            max_requests: parse_num(&get, "RATE_LIMIT_MAX_REQUESTS")?
                .unwrap_or(defaults.max_requests),
            window_hours: parse_num(&get, "RATE_LIMIT_WINDOW_HOURS")?
                .unwrap_or(defaults.window_hours),
        };

        let retry = RetryConfig {
            max_retries: parse_num(&get, "MAX_RETRIES")?
                .unwrap_or(RetryConfig::default().max_retries),
        };

        let username = get("EMAIL_ACCOUNT").or_else(|| get("EMAIL_USERNAME"));
        let mailbox = match username {
            Some(username) => Some(mailbox_config(&get, username)?),
            None => None,
        };

        Ok(Self {
            mailbox,
            whitelist,
            queue,
            rate_limit,
            retry,
        })
    }
}

fn mailbox_config<G>(get: &G, username: String) -> Result<MailboxConfig, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let provider = detect_provider(&username);

    let imap_host = get("EMAIL_IMAP_SERVER")
        .or_else(|| provider.map(|p| p.imap_host.to_string()))
        .ok_or_else(|| ConfigError::MissingRequired {
            key: "EMAIL_IMAP_SERVER".into(),
            hint: format!("No known mail provider for {username}; set the IMAP server explicitly."),
        })?;
    let smtp_host = get("EMAIL_SMTP_SERVER")
        .or_else(|| provider.map(|p| p.smtp_host.to_string()))
        .unwrap_or_else(|| imap_host.replace("imap", "smtp"));

    let imap_port = parse_num(get, "EMAIL_IMAP_PORT")?
        .or(provider.map(|p| p.imap_port))
        .unwrap_or(993);
    let smtp_port = parse_num(get, "EMAIL_SMTP_PORT")?
        .or(provider.map(|p| p.smtp_port))
        .unwrap_or(587);

    let poll_interval_secs = parse_num(get, "POLLING_INTERVAL")?.unwrap_or(60);
    if poll_interval_secs == 0 {
        return Err(ConfigError::InvalidValue {
            key: "POLLING_INTERVAL".into(),
            message: "must be greater than zero".into(),
        });
    }

    Ok(MailboxConfig {
        imap_host,
        imap_port,
        smtp_host,
        smtp_port,
        password: SecretString::from(get("EMAIL_PASSWORD").unwrap_or_default()),
        username,
        poll_interval_secs,
    })
}

/// Split a comma-separated list, trimming entries and dropping blanks.
pub fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_num<G, T>(get: &G, key: &str) -> Result<Option<T>, ConfigError>
where
    G: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    get(key)
        .map(|raw| {
            raw.parse().map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            })
        })
        .transpose()
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?} is not a boolean"),
        }),
    }
}

// ── Mail providers ──────────────────────────────────────────────────

/// How a provider expects clients to authenticate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthKind {
    /// The regular account password.
    Password,
    /// A per-application password generated in account settings.
    AppPassword,
    /// A mailbox authorization code issued for IMAP/SMTP access.
    AuthCode,
}

/// Well-known IMAP/SMTP endpoints for a mail domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailProvider {
    pub domain: &'static str,
    pub name: &'static str,
    pub imap_host: &'static str,
    pub imap_port: u16,
    pub smtp_host: &'static str,
    pub smtp_port: u16,
    pub auth: AuthKind,
}

static MAIL_PROVIDERS: &[MailProvider] = &[
    MailProvider {
        domain: "qq.com",
        name: "QQ Mail",
        imap_host: "imap.qq.com",
        imap_port: 993,
        smtp_host: "smtp.qq.com",
        smtp_port: 587,
        auth: AuthKind::AuthCode,
    },
    MailProvider {
        domain: "163.com",
        name: "NetEase 163",
        imap_host: "imap.163.com",
        imap_port: 993,
        smtp_host: "smtp.163.com",
        smtp_port: 465,
        auth: AuthKind::AuthCode,
    },
    MailProvider {
        domain: "126.com",
        name: "NetEase 126",
        imap_host: "imap.126.com",
        imap_port: 993,
        smtp_host: "smtp.126.com",
        smtp_port: 465,
        auth: AuthKind::AuthCode,
    },
    MailProvider {
        domain: "gmail.com",
        name: "Gmail",
        imap_host: "imap.gmail.com",
        imap_port: 993,
        smtp_host: "smtp.gmail.com",
        smtp_port: 587,
        auth: AuthKind::AppPassword,
    },
    MailProvider {
        domain: "outlook.com",
        name: "Outlook",
        imap_host: "outlook.office365.com",
        imap_port: 993,
        smtp_host: "smtp.office365.com",
        smtp_port: 587,
        auth: AuthKind::Password,
    },
    MailProvider {
        domain: "hotmail.com",
        name: "Hotmail",
        imap_host: "outlook.office365.com",
        imap_port: 993,
        smtp_host: "smtp.office365.com",
        smtp_port: 587,
        auth: AuthKind::Password,
    },
    MailProvider {
        domain: "yahoo.com",
        name: "Yahoo Mail",
        imap_host: "imap.mail.yahoo.com",
        imap_port: 993,
        smtp_host: "smtp.mail.yahoo.com",
        smtp_port: 587,
        auth: AuthKind::AppPassword,
    },
    MailProvider {
        domain: "icloud.com",
        name: "iCloud",
        imap_host: "imap.mail.me.com",
        imap_port: 993,
        smtp_host: "smtp.mail.me.com",
        smtp_port: 587,
        auth: AuthKind::AppPassword,
    },
];

/// Look up the provider for an address by its domain.
pub fn detect_provider(address: &str) -> Option<&'static MailProvider> {
    let (_, domain) = address.trim().rsplit_once('@')?;
    MAIL_PROVIDERS
        .iter()
        .find(|p| p.domain.eq_ignore_ascii_case(domain))
}
