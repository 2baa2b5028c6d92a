//! Startup configuration. Everything is read once from the environment
//! (a `.env` file is honoured via dotenvy) and carried in an immutable
//! [`RelayConfig`] for the life of the process.

use std::collections::HashSet;

use crate::error::InitError;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_port: u16,
    /// SQLite database path; `":memory:"` runs fully in memory (tests).
    pub db_path: String,
    /// Self URLs; NIP-42 AUTH events must carry a `relay` tag whose host
    /// matches one of these.
    pub urls: Vec<String>,

    pub name: String,
    pub description: String,
    pub contact: Option<String>,
    pub pubkey: Option<String>,

    pub max_message_length: usize,
    pub max_content_length: usize,
    pub max_event_tags: usize,
    pub max_tag_value_length: usize,
    pub max_subid_length: usize,

    pub max_future_seconds: u64,
    pub max_past_seconds: Option<u64>,

    pub max_subscriptions_per_connection: usize,
    pub max_filters_per_subscription: usize,
    pub max_limit: usize,

    pub auth_required: bool,
    pub max_auth_age_seconds: u64,

    /// When set, only these pubkeys may publish.
    pub allowed_pubkeys: Option<HashSet<String>>,
    pub blocked_pubkeys: HashSet<String>,
    /// When set, only these kinds are accepted.
    pub allowed_kinds: Option<HashSet<u16>>,
    pub blocked_kinds: HashSet<u16>,

    /// Outbound frame queue high-water mark; overflow disconnects.
    pub outbound_queue_size: usize,
    /// Inbound frames per second before `rate-limited:` NOTICEs.
    pub max_messages_per_second: u32,

    pub neg_max_sessions_per_connection: usize,
    pub neg_session_timeout_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_port: 7447,
            db_path: ":memory:".to_string(),
            urls: vec!["ws://localhost:7447".to_string()],
            name: "rostrum".to_string(),
            description: "A Nostr relay".to_string(),
            contact: None,
            pubkey: None,
            max_message_length: 131_072,
            max_content_length: 65_536,
            max_event_tags: 2_000,
            max_tag_value_length: 1_024,
            max_subid_length: 71,
            max_future_seconds: 900,
            max_past_seconds: None,
            max_subscriptions_per_connection: 64,
            max_filters_per_subscription: 10,
            max_limit: 5_000,
            auth_required: false,
            max_auth_age_seconds: 600,
            allowed_pubkeys: None,
            blocked_pubkeys: HashSet::new(),
            allowed_kinds: None,
            blocked_kinds: HashSet::new(),
            outbound_queue_size: 1_024,
            max_messages_per_second: 50,
            neg_max_sessions_per_connection: 8,
            neg_session_timeout_ms: 60_000,
        }
    }
}

impl RelayConfig {
    /// Read configuration from `RELAY_*` environment variables, falling
    /// back to defaults for anything unset.
    pub fn from_env() -> Result<Self, InitError> {
        let mut cfg = Self::default();

        if let Some(port) = parse_var("RELAY_PORT")? {
            cfg.listen_port = port;
        }
        if let Ok(path) = std::env::var("RELAY_DB_PATH") {
            cfg.db_path = path;
        }
        if let Ok(urls) = std::env::var("RELAY_URLS") {
            cfg.urls = split_list(&urls);
            if cfg.urls.is_empty() {
                return Err(InitError::Config("RELAY_URLS must not be empty".into()));
            }
        }
        if let Ok(name) = std::env::var("RELAY_NAME") {
            cfg.name = name;
        }
        if let Ok(description) = std::env::var("RELAY_DESCRIPTION") {
            cfg.description = description;
        }
        cfg.contact = std::env::var("RELAY_CONTACT").ok().or(cfg.contact);
        cfg.pubkey = std::env::var("RELAY_PUBKEY").ok().or(cfg.pubkey);

        set_from(&mut cfg.max_message_length, "RELAY_MAX_MESSAGE_LENGTH")?;
        set_from(&mut cfg.max_content_length, "RELAY_MAX_CONTENT_LENGTH")?;
        set_from(&mut cfg.max_event_tags, "RELAY_MAX_EVENT_TAGS")?;
        set_from(&mut cfg.max_tag_value_length, "RELAY_MAX_TAG_VALUE_LENGTH")?;
        set_from(&mut cfg.max_subid_length, "RELAY_MAX_SUBID_LENGTH")?;
        set_from(&mut cfg.max_future_seconds, "RELAY_MAX_FUTURE_SECONDS")?;
        cfg.max_past_seconds = parse_var("RELAY_MAX_PAST_SECONDS")?.or(cfg.max_past_seconds);
        set_from(
            &mut cfg.max_subscriptions_per_connection,
            "RELAY_MAX_SUBSCRIPTIONS",
        )?;
        set_from(&mut cfg.max_filters_per_subscription, "RELAY_MAX_FILTERS")?;
        set_from(&mut cfg.max_limit, "RELAY_MAX_LIMIT")?;
        set_from(&mut cfg.outbound_queue_size, "RELAY_OUTBOUND_QUEUE_SIZE")?;
        set_from(
            &mut cfg.max_messages_per_second,
            "RELAY_MAX_MESSAGES_PER_SECOND",
        )?;
        set_from(&mut cfg.max_auth_age_seconds, "RELAY_MAX_AUTH_AGE_SECONDS")?;
        set_from(
            &mut cfg.neg_max_sessions_per_connection,
            "RELAY_NEG_MAX_SESSIONS",
        )?;
        set_from(&mut cfg.neg_session_timeout_ms, "RELAY_NEG_SESSION_TIMEOUT_MS")?;

        if let Ok(v) = std::env::var("RELAY_AUTH_REQUIRED") {
            cfg.auth_required = matches!(v.trim(), "1" | "true" | "yes");
        }

        if let Ok(list) = std::env::var("RELAY_ALLOWED_PUBKEYS") {
            cfg.allowed_pubkeys = Some(split_list(&list).into_iter().collect());
        }
        if let Ok(list) = std::env::var("RELAY_BLOCKED_PUBKEYS") {
            cfg.blocked_pubkeys = split_list(&list).into_iter().collect();
        }
        if let Ok(list) = std::env::var("RELAY_ALLOWED_KINDS") {
            cfg.allowed_kinds = Some(parse_kind_list(&list, "RELAY_ALLOWED_KINDS")?);
        }
        if let Ok(list) = std::env::var("RELAY_BLOCKED_KINDS") {
            cfg.blocked_kinds = parse_kind_list(&list, "RELAY_BLOCKED_KINDS")?;
        }

        Ok(cfg)
    }

    /// `created_at` floor advertised in the NIP-11 limitation block.
    pub fn created_at_lower_limit(&self, now: u64) -> u64 {
        match self.max_past_seconds {
            Some(past) => now.saturating_sub(past),
            None => 0,
        }
    }

    /// `created_at` ceiling advertised in the NIP-11 limitation block.
    pub fn created_at_upper_limit(&self, now: u64) -> u64 {
        now.saturating_add(self.max_future_seconds)
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn parse_kind_list(raw: &str, var: &str) -> Result<HashSet<u16>, InitError> {
    split_list(raw)
        .into_iter()
        .map(|s| {
            s.parse()
                .map_err(|_| InitError::Config(format!("{var}: bad kind {s:?}")))
        })
        .collect()
}

fn parse_var<T: std::str::FromStr>(var: &str) -> Result<Option<T>, InitError> {
    match std::env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| InitError::Config(format!("{var}: bad value {raw:?}"))),
        Err(_) => Ok(None),
    }
}

fn set_from<T: std::str::FromStr>(slot: &mut T, var: &str) -> Result<(), InitError> {
    if let Some(value) = parse_var(var)? {
        *slot = value;
    }
    Ok(())
}
