//! Runtime configuration.
//!
//! Every tunable is read from a `HARVEST_*` environment variable and falls
//! back to a default when the variable is absent or does not parse. CLI
//! flags are applied on top by the `run` subcommand.

use crate::clock::DelayBand;
use crate::error::HarvestError;
use crate::model::WindowPlan;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_REPORT_URL: &str =
    "http://mvpepprd.saude.go.gov.br/report-executor/report-viewer?id=7076";

const PARAMETERS_PANEL: &str = "//div[contains(@id, '_ParametersPanelContainer')]";

pub const DEFAULT_USER_AGENTS: [&str; 5] = [
    "Mozilla/5.0 (X11; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (X11; Ubuntu; Linux x86_64; rv:115.0) Gecko/20100101 Firefox/115.0",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/115.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64; rv:116.0) Gecko/20100101 Firefox/116.0",
    "Mozilla/5.0 (X11; Ubuntu; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0",
];

/// What to do when no window of a task finds the entity's row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotFoundPolicy {
    /// The task fails with the `not_found` category; nothing is written.
    #[default]
    Fail,
    /// A zero record is written using descriptive fields from the entity.
    Empty,
}

impl FromStr for NotFoundPolicy {
    type Err = HarvestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail" => Ok(Self::Fail),
            "empty" | "zero" => Ok(Self::Empty),
            other => Err(HarvestError::Config(format!(
                "unknown not-found policy '{other}' (expected fail or empty)"
            ))),
        }
    }
}

/// Structural locators of the report's parameter form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormLayout {
    pub entity_input: String,
    pub start_input: String,
    pub end_input: String,
    /// Submit locators, tried in order: structural XPath, text match XPath,
    /// then a generic CSS submit-input match.
    pub submit_structural: String,
    pub submit_text: String,
    pub submit_generic: String,
    /// Substring of the id of the iframe that may host the result table.
    pub frame_marker: String,
    /// `chrono` format the report expects for dates.
    pub date_format: String,
}

impl Default for FormLayout {
    fn default() -> Self {
        Self {
            entity_input: format!("{PARAMETERS_PANEL}//tr[2]/td[2]//input"),
            start_input: format!("{PARAMETERS_PANEL}//tr[1]/td[4]//input"),
            end_input: format!("{PARAMETERS_PANEL}//tr[2]/td[4]//input"),
            submit_structural: format!("{PARAMETERS_PANEL}//tr[4]/td[4]//td[contains(., 'Submit')]"),
            submit_text: "//td[contains(text(), 'Submit')]".to_string(),
            submit_generic: "input[type='submit']".to_string(),
            frame_marker: "Viewer".to_string(),
            date_format: "%m.%d.%Y".to_string(),
        }
    }
}

impl FormLayout {
    fn from_env() -> Self {
        let d = Self::default();
        Self {
            entity_input: read_env_string("HARVEST_FORM_ENTITY_XPATH").unwrap_or(d.entity_input),
            start_input: read_env_string("HARVEST_FORM_START_XPATH").unwrap_or(d.start_input),
            end_input: read_env_string("HARVEST_FORM_END_XPATH").unwrap_or(d.end_input),
            submit_structural: read_env_string("HARVEST_FORM_SUBMIT_XPATH")
                .unwrap_or(d.submit_structural),
            submit_text: read_env_string("HARVEST_FORM_SUBMIT_TEXT_XPATH").unwrap_or(d.submit_text),
            submit_generic: read_env_string("HARVEST_FORM_SUBMIT_CSS").unwrap_or(d.submit_generic),
            frame_marker: read_env_string("HARVEST_FORM_FRAME_MARKER").unwrap_or(d.frame_marker),
            date_format: read_env_string("HARVEST_FORM_DATE_FORMAT").unwrap_or(d.date_format),
        }
    }
}

/// Exponential backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub max_attempts: u32,
    pub initial: Duration,
    pub cap: Duration,
    /// Upper bound of the jitter, as a fraction of the un-jittered delay.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial: Duration::from_secs(8),
            cap: Duration::from_secs(120),
            jitter: 0.3,
        }
    }
}

/// Where records are reconciled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreTarget {
    /// PostgREST endpoint with a service key.
    Rest { url: String, key: String },
    Sqlite(PathBuf),
}

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub report_url: String,
    pub store: Option<StoreTarget>,
    pub chromium_path: Option<PathBuf>,
    pub headless: bool,
    pub state_dir: PathBuf,

    pub backoff: BackoffConfig,
    /// Completed items per session before a forced rotation.
    pub restart_interval: u32,
    /// Consecutive item failures that open the circuit.
    pub failure_threshold: u32,
    pub cooldown: Duration,
    /// Completed items between health checks.
    pub health_check_interval: u32,
    pub max_session_age: Duration,
    /// Items between cookie/storage wipes; 0 disables.
    pub clear_state_every: u32,

    pub launch_timeout: Duration,
    pub page_load_timeout: Duration,
    pub element_wait: Duration,
    pub poll_interval: Duration,

    pub post_navigate_delay: DelayBand,
    pub field_delay: DelayBand,
    pub settle_delay: DelayBand,
    pub window_delay: DelayBand,
    pub item_delay: DelayBand,

    pub screenshot_dir: PathBuf,
    pub screenshot_retention: Duration,

    pub user_agents: Vec<String>,
    pub viewport: (u32, u32),
    pub form: FormLayout,
    pub window_plan: WindowPlan,
    pub not_found_policy: NotFoundPolicy,

    pub memory_limit_pct: f64,
    pub disk_limit_pct: f64,
    pub pressure_pause: Duration,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        let state_dir = default_state_dir();
        Self {
            report_url: DEFAULT_REPORT_URL.to_string(),
            store: None,
            chromium_path: None,
            headless: true,
            screenshot_dir: state_dir.join("screenshots"),
            state_dir,
            backoff: BackoffConfig::default(),
            restart_interval: 25,
            failure_threshold: 3,
            cooldown: Duration::from_secs(60),
            health_check_interval: 5,
            max_session_age: Duration::from_secs(30 * 60),
            clear_state_every: 1,
            launch_timeout: Duration::from_secs(60),
            page_load_timeout: Duration::from_secs(240),
            element_wait: Duration::from_secs(45),
            poll_interval: Duration::from_millis(500),
            post_navigate_delay: DelayBand::from_secs(5, 8),
            field_delay: DelayBand::new(Duration::from_millis(800), Duration::from_millis(2500)),
            settle_delay: DelayBand::from_secs(15, 22),
            window_delay: DelayBand::from_secs(4, 7),
            item_delay: DelayBand::from_secs(10, 20),
            screenshot_retention: Duration::from_secs(7 * 24 * 3600),
            user_agents: DEFAULT_USER_AGENTS.iter().map(|s| s.to_string()).collect(),
            viewport: (1920, 1080),
            form: FormLayout::default(),
            window_plan: WindowPlan::single(),
            not_found_policy: NotFoundPolicy::Fail,
            memory_limit_pct: 90.0,
            disk_limit_pct: 90.0,
            pressure_pause: Duration::from_secs(30),
        }
    }
}

impl HarvestConfig {
    pub fn from_env() -> Result<Self, HarvestError> {
        let d = Self::default();
        let state_dir = read_env_string("HARVEST_STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or(d.state_dir);

        let store = match (
            read_env_string("HARVEST_STORE_URL"),
            read_env_string("HARVEST_STORE_KEY"),
            read_env_string("HARVEST_SQLITE_PATH"),
        ) {
            (Some(url), Some(key), _) => Some(StoreTarget::Rest { url, key }),
            (Some(_), None, _) => {
                return Err(HarvestError::Config(
                    "HARVEST_STORE_URL is set but HARVEST_STORE_KEY is missing".into(),
                ))
            }
            (None, _, Some(path)) => Some(StoreTarget::Sqlite(PathBuf::from(path))),
            (None, _, None) => None,
        };

        let window_plan = match read_env_string("HARVEST_WINDOW_PLAN") {
            Some(raw) => raw.parse()?,
            None => d.window_plan,
        };
        let not_found_policy = match read_env_string("HARVEST_NOT_FOUND_POLICY") {
            Some(raw) => raw.parse()?,
            None => d.not_found_policy,
        };
        let user_agents = read_env_string("HARVEST_USER_AGENTS")
            .map(|raw| {
                raw.split('|')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect::<Vec<_>>()
            })
            .filter(|v| !v.is_empty())
            .unwrap_or(d.user_agents);

        let cfg = Self {
            report_url: read_env_string("HARVEST_REPORT_URL").unwrap_or(d.report_url),
            store,
            chromium_path: read_env_string("HARVEST_CHROMIUM_PATH").map(PathBuf::from),
            headless: read_env_bool("HARVEST_HEADLESS", d.headless),
            screenshot_dir: read_env_string("HARVEST_SCREENSHOT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| state_dir.join("screenshots")),
            state_dir,
            backoff: BackoffConfig {
                max_attempts: read_env_u32("HARVEST_MAX_RETRIES", d.backoff.max_attempts).max(1),
                initial: secs("HARVEST_RETRY_INITIAL_SECS", d.backoff.initial),
                cap: secs("HARVEST_RETRY_CAP_SECS", d.backoff.cap),
                jitter: read_env_f64("HARVEST_RETRY_JITTER", d.backoff.jitter).clamp(0.0, 1.0),
            },
            restart_interval: read_env_u32("HARVEST_RESTART_INTERVAL", d.restart_interval),
            failure_threshold: read_env_u32("HARVEST_FAILURE_THRESHOLD", d.failure_threshold),
            cooldown: secs("HARVEST_COOLDOWN_SECS", d.cooldown),
            health_check_interval: read_env_u32("HARVEST_HEALTH_INTERVAL", d.health_check_interval),
            max_session_age: secs("HARVEST_MAX_SESSION_AGE_SECS", d.max_session_age),
            clear_state_every: read_env_u32("HARVEST_CLEAR_STATE_EVERY", d.clear_state_every),
            launch_timeout: secs("HARVEST_LAUNCH_TIMEOUT_SECS", d.launch_timeout),
            page_load_timeout: secs("HARVEST_PAGE_LOAD_TIMEOUT_SECS", d.page_load_timeout),
            element_wait: secs("HARVEST_ELEMENT_WAIT_SECS", d.element_wait),
            poll_interval: Duration::from_millis(
                read_env_u64("HARVEST_POLL_MILLIS", d.poll_interval.as_millis() as u64).max(10),
            ),
            post_navigate_delay: band("HARVEST_NAVIGATE_DELAY", d.post_navigate_delay),
            field_delay: d.field_delay,
            settle_delay: band("HARVEST_SETTLE", d.settle_delay),
            window_delay: band("HARVEST_WINDOW_DELAY", d.window_delay),
            item_delay: band("HARVEST_ITEM_DELAY", d.item_delay),
            screenshot_retention: Duration::from_secs(
                read_env_u64("HARVEST_SCREENSHOT_RETENTION_DAYS", 7) * 24 * 3600,
            ),
            user_agents,
            viewport: d.viewport,
            form: FormLayout::from_env(),
            window_plan,
            not_found_policy,
            memory_limit_pct: read_env_f64("HARVEST_MEMORY_LIMIT_PCT", d.memory_limit_pct),
            disk_limit_pct: read_env_f64("HARVEST_DISK_LIMIT_PCT", d.disk_limit_pct),
            pressure_pause: secs("HARVEST_PRESSURE_PAUSE_SECS", d.pressure_pause),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), HarvestError> {
        url::Url::parse(&self.report_url).map_err(|e| {
            HarvestError::Config(format!("invalid report url '{}': {e}", self.report_url))
        })?;
        if let Some(StoreTarget::Rest { url, .. }) = &self.store {
            url::Url::parse(url)
                .map_err(|e| HarvestError::Config(format!("invalid store url '{url}': {e}")))?;
        }
        if self.user_agents.is_empty() {
            return Err(HarvestError::Config("user agent pool is empty".into()));
        }
        if chrono::format::StrftimeItems::new(&self.form.date_format)
            .any(|item| matches!(item, chrono::format::Item::Error))
        {
            return Err(HarvestError::Config(format!(
                "invalid date format '{}'",
                self.form.date_format
            )));
        }
        if self.backoff.cap < self.backoff.initial {
            return Err(HarvestError::Config(
                "retry cap must not be smaller than the initial delay".into(),
            ));
        }
        Ok(())
    }

    /// Directory holding per-session browser profiles.
    pub fn profile_root(&self) -> PathBuf {
        self.state_dir.join("profiles")
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.state_dir.join("ledger.jsonl")
    }

    /// Zero every delay band and shrink timeouts. Used by tests and dry runs.
    pub fn without_delays(mut self) -> Self {
        self.post_navigate_delay = DelayBand::ZERO;
        self.field_delay = DelayBand::ZERO;
        self.settle_delay = DelayBand::ZERO;
        self.window_delay = DelayBand::ZERO;
        self.item_delay = DelayBand::ZERO;
        self.backoff.jitter = 0.0;
        self
    }
}

fn default_state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".harvest")
}

fn secs(name: &str, default_value: Duration) -> Duration {
    Duration::from_secs(read_env_u64(name, default_value.as_secs()))
}

/// Reads `<PREFIX>_MIN_SECS` and `<PREFIX>_MAX_SECS`.
fn band(prefix: &str, default_value: DelayBand) -> DelayBand {
    DelayBand::new(
        secs(&format!("{prefix}_MIN_SECS"), default_value.min),
        secs(&format!("{prefix}_MAX_SECS"), default_value.max),
    )
}

fn read_env_u64(name: &str, default_value: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default_value)
}

fn read_env_u32(name: &str, default_value: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default_value)
}

fn read_env_f64(name: &str, default_value: f64) -> f64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(default_value)
}

fn read_env_bool(name: &str, default_value: bool) -> bool {
    match read_env_string(name).as_deref().map(str::to_ascii_lowercase).as_deref() {
        Some("1" | "true" | "yes" | "on") => true,
        Some("0" | "false" | "no" | "off") => false,
        _ => default_value,
    }
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_report_conventions() {
        let cfg = HarvestConfig::default();
        assert_eq!(cfg.backoff.max_attempts, 5);
        assert_eq!(cfg.restart_interval, 25);
        assert_eq!(cfg.failure_threshold, 3);
        assert_eq!(cfg.viewport, (1920, 1080));
        assert_eq!(cfg.user_agents.len(), 5);
        assert!(cfg.form.entity_input.ends_with("//tr[2]/td[2]//input"));
        cfg.validate().unwrap();
    }

    #[test]
    fn not_found_policy_parses() {
        assert_eq!("EMPTY".parse::<NotFoundPolicy>().unwrap(), NotFoundPolicy::Empty);
        assert_eq!("fail".parse::<NotFoundPolicy>().unwrap(), NotFoundPolicy::Fail);
        assert!("skip".parse::<NotFoundPolicy>().is_err());
    }

    #[test]
    fn validate_rejects_bad_urls() {
        let mut cfg = HarvestConfig::default();
        cfg.report_url = "not a url".into();
        assert!(matches!(cfg.validate(), Err(HarvestError::Config(_))));
    }

    #[test]
    fn without_delays_zeroes_bands() {
        let cfg = HarvestConfig::default().without_delays();
        assert_eq!(cfg.settle_delay, DelayBand::ZERO);
        assert_eq!(cfg.backoff.jitter, 0.0);
    }
}
