//! Core domain model for offerscout: source configuration, candidates, runs and conflicts.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "offerscout-core";

pub const DEFAULT_IDENTITY: &str = "offerscout-bot/0.1";
pub const DEFAULT_TIMEOUT_MS: u64 = 20_000;
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 2;

/// CSS selectors locating one offer container and, inside it, each field of interest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LocationPatterns {
    #[serde(default)]
    pub container: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub reward_amount: String,
    #[serde(default)]
    pub requirements: Option<String>,
    #[serde(default)]
    pub expiry: Option<String>,
}

/// Regexes applied to field fragments. Each must carry exactly one capture group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionPatterns {
    #[serde(default = "default_reward_amount_pattern")]
    pub reward_amount_pattern: String,
    #[serde(default = "default_requirements_count_pattern")]
    pub requirements_count_pattern: String,
    #[serde(default = "default_pay_in_pattern")]
    pub pay_in_pattern: String,
    #[serde(default = "default_expiry_pattern")]
    pub expiry_pattern: String,
    #[serde(default = "default_date_layout")]
    pub date_layout: String,
}

impl Default for ExtractionPatterns {
    fn default() -> Self {
        Self {
            reward_amount_pattern: default_reward_amount_pattern(),
            requirements_count_pattern: default_requirements_count_pattern(),
            pay_in_pattern: default_pay_in_pattern(),
            expiry_pattern: default_expiry_pattern(),
            date_layout: default_date_layout(),
        }
    }
}

fn default_reward_amount_pattern() -> String {
    r"£([0-9,]+(?:\.[0-9]{1,2})?)".to_string()
}

fn default_requirements_count_pattern() -> String {
    r"(?i)(\d+)\s+(?:direct debits?|recurring payments?)".to_string()
}

fn default_pay_in_pattern() -> String {
    r"(?i)pay in (?:at least )?£([0-9,]+(?:\.[0-9]{1,2})?)".to_string()
}

fn default_expiry_pattern() -> String {
    r"(\d{1,2}/\d{1,2}/\d{4})".to_string()
}

fn default_date_layout() -> String {
    "%d/%m/%Y".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOptions {
    /// Sent as the `User-Agent` header.
    #[serde(default = "default_identity")]
    pub identity: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Days an expiry date may lie in the past before the candidate is flagged stale.
    #[serde(default)]
    pub expiry_grace_days: u32,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            identity: default_identity(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            expiry_grace_days: 0,
        }
    }
}

fn default_identity() -> String {
    DEFAULT_IDENTITY.to_string()
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_retry_attempts() -> u32 {
    DEFAULT_RETRY_ATTEMPTS
}

/// Administrator-owned description of one source. Runs read it and never write it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub location_patterns: LocationPatterns,
    #[serde(default)]
    pub extraction_patterns: ExtractionPatterns,
    #[serde(default)]
    pub options: RunOptions,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing mandatory config key `{0}`")]
    MissingKey(&'static str),
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("invalid selector for `{key}`: {reason}")]
    InvalidSelector { key: &'static str, reason: String },
    #[error("invalid pattern for `{key}`: {reason}")]
    InvalidPattern { key: &'static str, reason: String },
    #[error("pattern `{key}` must have exactly one capture group, found {found}")]
    CaptureGroups { key: &'static str, found: usize },
    #[error("unknown template `{0}`")]
    UnknownTemplate(String),
}

impl SourceConfig {
    pub fn from_template(
        template: ConfigTemplate,
        source_id: impl Into<String>,
        name: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            name: name.into(),
            url: url.into(),
            priority: 0,
            is_active: true,
            location_patterns: template.location_patterns(),
            extraction_patterns: ExtractionPatterns::default(),
            options: RunOptions::default(),
        }
    }

    /// Structural checks that do not need a selector or regex engine.
    ///
    /// Selector and pattern compilation is checked by the extraction crate when the
    /// patterns are compiled, which also happens before any fetch.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source_id.trim().is_empty() {
            return Err(ConfigError::MissingKey("source_id"));
        }
        validate_url(&self.url)?;
        let loc = &self.location_patterns;
        if loc.container.trim().is_empty() {
            return Err(ConfigError::MissingKey("location_patterns.container"));
        }
        if loc.name.trim().is_empty() {
            return Err(ConfigError::MissingKey("location_patterns.name"));
        }
        if loc.reward_amount.trim().is_empty() {
            return Err(ConfigError::MissingKey("location_patterns.reward_amount"));
        }
        let ext = &self.extraction_patterns;
        if ext.reward_amount_pattern.trim().is_empty() {
            return Err(ConfigError::MissingKey("extraction_patterns.reward_amount_pattern"));
        }
        if ext.date_layout.trim().is_empty() {
            return Err(ConfigError::MissingKey("extraction_patterns.date_layout"));
        }
        Ok(())
    }
}

pub fn validate_url(raw: &str) -> Result<(), ConfigError> {
    if raw.trim().is_empty() {
        return Err(ConfigError::MissingKey("url"));
    }
    let parsed = url::Url::parse(raw).map_err(|e| ConfigError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(ConfigError::InvalidUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme {other}"),
        }),
    }
}

/// Starting points for common page shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConfigTemplate {
    GenericCardList,
    TableRows,
}

impl ConfigTemplate {
    pub fn all() -> &'static [ConfigTemplate] {
        &[ConfigTemplate::GenericCardList, ConfigTemplate::TableRows]
    }

    pub fn key(&self) -> &'static str {
        match self {
            ConfigTemplate::GenericCardList => "generic-card-list",
            ConfigTemplate::TableRows => "table-rows",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ConfigTemplate::GenericCardList => "one element per offer with class-named children",
            ConfigTemplate::TableRows => "one table row per offer, fields in fixed columns",
        }
    }

    pub fn location_patterns(&self) -> LocationPatterns {
        match self {
            ConfigTemplate::GenericCardList => LocationPatterns {
                container: ".offer".to_string(),
                name: ".offer-name".to_string(),
                reward_amount: ".offer-reward".to_string(),
                requirements: Some(".offer-requirements".to_string()),
                expiry: Some(".offer-expiry".to_string()),
            },
            ConfigTemplate::TableRows => LocationPatterns {
                container: "table.offers tbody tr".to_string(),
                name: "td:nth-child(1)".to_string(),
                reward_amount: "td:nth-child(2)".to_string(),
                requirements: Some("td:nth-child(3)".to_string()),
                expiry: Some("td:nth-child(4)".to_string()),
            },
        }
    }
}

impl FromStr for ConfigTemplate {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ConfigTemplate::all()
            .iter()
            .copied()
            .find(|t| t.key() == s)
            .ok_or_else(|| ConfigError::UnknownTemplate(s.to_string()))
    }
}

/// Fields an offer candidate is assembled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OfferField {
    Name,
    RewardAmount,
    RequiredPayments,
    PayInThreshold,
    Expiry,
}

impl OfferField {
    pub fn as_str(&self) -> &'static str {
        match self {
            OfferField::Name => "name",
            OfferField::RewardAmount => "rewardAmount",
            OfferField::RequiredPayments => "requiredPayments",
            OfferField::PayInThreshold => "payInThreshold",
            OfferField::Expiry => "expiry",
        }
    }
}

impl fmt::Display for OfferField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-field extraction failure. Recorded as diagnostics, never propagated.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractionError {
    #[error("FieldNotFound")]
    FieldNotFound,
    #[error("InvalidAmount: {raw:?}")]
    InvalidAmount { raw: String },
    #[error("InvalidDate: {raw:?} does not match {layout:?}")]
    InvalidDate { raw: String, layout: String },
}

/// Candidate-level defect; marks the candidate unusable without failing the run.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationError {
    #[error("MissingMandatoryField: {field}")]
    MissingMandatoryField { field: OfferField },
    #[error("NonPositiveAmount: {amount}")]
    NonPositiveAmount { amount: f64 },
    #[error("StaleExpiry: {expiry} is before {cutoff}")]
    StaleExpiry { expiry: NaiveDate, cutoff: NaiveDate },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FieldStatus {
    Extracted { value: String },
    /// Pattern did not match and the field has a legitimate default.
    Defaulted { value: String },
    Failed { error: ExtractionError },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDiagnostic {
    pub field: OfferField,
    pub fragment: Option<String>,
    #[serde(flatten)]
    pub status: FieldStatus,
}

impl FieldDiagnostic {
    pub fn failed(&self) -> Option<&ExtractionError> {
        match &self.status {
            FieldStatus::Failed { error } => Some(error),
            _ => None,
        }
    }
}

/// Typed offer values extracted from one container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferFields {
    pub name: String,
    pub reward_amount: f64,
    pub required_payments: u32,
    pub pay_in_threshold: Option<f64>,
    pub expiry: Option<NaiveDate>,
}

/// Transient result for one container; never persisted as its own entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub container_index: usize,
    pub offer: Option<OfferFields>,
    pub diagnostics: Vec<FieldDiagnostic>,
    pub defects: Vec<ValidationError>,
}

impl CandidateRecord {
    pub fn is_usable(&self) -> bool {
        self.offer.is_some() && self.defects.is_empty()
    }

    pub fn defect_messages(&self) -> Vec<String> {
        self.defects.iter().map(ToString::to_string).collect()
    }
}

/// The store's current record for a named entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredOffer {
    pub name: String,
    pub source_id: String,
    pub reward_amount: f64,
    pub required_payments: u32,
    pub pay_in_threshold: Option<f64>,
    pub expiry: Option<NaiveDate>,
    pub updated_at: DateTime<Utc>,
}

impl StoredOffer {
    pub fn from_fields(source_id: &str, fields: &OfferFields, at: DateTime<Utc>) -> Self {
        Self {
            name: fields.name.clone(),
            source_id: source_id.to_string(),
            reward_amount: fields.reward_amount,
            required_payments: fields.required_payments,
            pay_in_threshold: fields.pay_in_threshold,
            expiry: fields.expiry,
            updated_at: at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Partial,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(RunStatus::Success),
            "partial" => Ok(RunStatus::Partial),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status `{other}`")),
        }
    }
}

/// Pipeline position of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Idle,
    Fetching,
    Locating,
    Extracting,
    Reconciling,
    Succeeded,
    PartiallySucceeded,
    Failed,
}

impl RunStage {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStage::Succeeded | RunStage::PartiallySucceeded | RunStage::Failed
        )
    }

    pub fn status(&self) -> Option<RunStatus> {
        match self {
            RunStage::Succeeded => Some(RunStatus::Success),
            RunStage::PartiallySucceeded => Some(RunStatus::Partial),
            RunStage::Failed => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

/// Append-only log entry for one execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub source_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub deals_found: u32,
    pub errors: Vec<String>,
    pub artifact_hash: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunFilter {
    pub source_id: Option<String>,
    pub status: Option<RunStatus>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl RunFilter {
    pub fn matches(&self, run: &RunRecord) -> bool {
        if let Some(source_id) = &self.source_id {
            if &run.source_id != source_id {
                return false;
            }
        }
        if let Some(status) = self.status {
            if run.status != status {
                return false;
            }
        }
        if let Some(from) = self.from {
            if run.started_at < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if run.started_at > to {
                return false;
            }
        }
        true
    }
}

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 200;

/// 1-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: usize,
    pub page_size: usize,
}

impl PageRequest {
    pub fn new(page: Option<usize>, page_size: Option<usize>) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            page_size: page_size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE),
        }
    }

    /// Saturates instead of overflowing; a page past the end is simply empty.
    pub fn offset(&self) -> usize {
        self.page.saturating_sub(1).saturating_mul(self.page_size)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(None, None)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunPage {
    pub runs: Vec<RunRecord>,
    pub total: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Pending,
    Accepted,
    Rejected,
}

impl ConflictStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStatus::Pending => "pending",
            ConflictStatus::Accepted => "accepted",
            ConflictStatus::Rejected => "rejected",
        }
    }
}

impl FromStr for ConflictStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ConflictStatus::Pending),
            "accepted" => Ok(ConflictStatus::Accepted),
            "rejected" => Ok(ConflictStatus::Rejected),
            other => Err(format!("unknown conflict status `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictDecision {
    Accept,
    Reject,
}

impl ConflictDecision {
    pub fn resulting_status(&self) -> ConflictStatus {
        match self {
            ConflictDecision::Accept => ConflictStatus::Accepted,
            ConflictDecision::Reject => ConflictStatus::Rejected,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: OfferField,
    pub old: String,
    pub new: String,
}

/// Divergence between a candidate and the stored record awaiting an operator decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: Uuid,
    pub run_id: Uuid,
    pub source_id: String,
    pub entity_name: String,
    pub changes: Vec<FieldChange>,
    /// Candidate values to apply if the conflict is accepted.
    pub proposed: OfferFields,
    pub status: ConflictStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictFilter {
    pub status: Option<ConflictStatus>,
    pub source_id: Option<String>,
}

impl ConflictFilter {
    pub fn matches(&self, conflict: &ConflictRecord) -> bool {
        self.status.map_or(true, |s| conflict.status == s)
            && self
                .source_id
                .as_deref()
                .map_or(true, |id| conflict.source_id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastRunSummary {
    pub status: RunStatus,
    pub deals_found: u32,
    pub at: DateTime<Utc>,
}

/// A stored source config with the summary of its latest run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceEntry {
    pub config: SourceConfig,
    pub last_run: Option<LastRunSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> SourceConfig {
        SourceConfig::from_template(
            ConfigTemplate::GenericCardList,
            "acme",
            "Acme offers",
            "https://example.com/offers",
        )
    }

    #[test]
    fn template_configs_validate() {
        for template in ConfigTemplate::all() {
            let config = SourceConfig::from_template(*template, "s", "S", "https://example.com/");
            config.validate().unwrap();
            assert_eq!(template.key().parse::<ConfigTemplate>().unwrap(), *template);
        }
    }

    #[test]
    fn minimal_yaml_fills_defaults() {
        let yaml = r#"
source_id: acme
name: Acme
url: https://example.com/offers
location_patterns:
  container: ".offer"
  name: ".title"
  reward_amount: ".reward"
"#;
        let config: SourceConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert!(config.is_active);
        assert_eq!(config.options.retry_attempts, DEFAULT_RETRY_ATTEMPTS);
        assert_eq!(config.options.identity, DEFAULT_IDENTITY);
        assert_eq!(config.extraction_patterns.date_layout, "%d/%m/%Y");
        assert_eq!(config.location_patterns.expiry, None);
    }

    #[test]
    fn validate_rejects_missing_container() {
        let mut config = sample_config();
        config.location_patterns.container = "  ".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::MissingKey("location_patterns.container"))
        );
    }

    #[test]
    fn validate_rejects_non_http_url() {
        let mut config = sample_config();
        config.url = "ftp://example.com/offers".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidUrl { .. })));
        config.url = String::new();
        assert_eq!(config.validate(), Err(ConfigError::MissingKey("url")));
    }

    #[test]
    fn validation_error_names_the_field() {
        let err = ValidationError::MissingMandatoryField {
            field: OfferField::RewardAmount,
        };
        assert_eq!(err.to_string(), "MissingMandatoryField: rewardAmount");
    }

    #[test]
    fn run_filter_applies_every_constraint() {
        let started = DateTime::parse_from_rfc3339("2026-03-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let run = RunRecord {
            run_id: Uuid::new_v4(),
            source_id: "acme".into(),
            started_at: started,
            finished_at: started,
            status: RunStatus::Partial,
            deals_found: 1,
            errors: vec![],
            artifact_hash: None,
        };
        assert!(RunFilter::default().matches(&run));
        assert!(RunFilter {
            source_id: Some("acme".into()),
            status: Some(RunStatus::Partial),
            from: Some(started - chrono::Duration::days(1)),
            to: Some(started),
        }
        .matches(&run));
        assert!(!RunFilter {
            status: Some(RunStatus::Success),
            ..Default::default()
        }
        .matches(&run));
        assert!(!RunFilter {
            from: Some(started + chrono::Duration::seconds(1)),
            ..Default::default()
        }
        .matches(&run));
    }

    #[test]
    fn page_request_clamps() {
        let page = PageRequest::new(Some(0), Some(10_000));
        assert_eq!(page.page, 1);
        assert_eq!(page.page_size, MAX_PAGE_SIZE);
        assert_eq!(PageRequest::new(Some(3), Some(10)).offset(), 20);
    }

    #[test]
    fn huge_page_numbers_saturate() {
        let page = PageRequest::new(Some(usize::MAX), Some(MAX_PAGE_SIZE));
        assert_eq!(page.offset(), usize::MAX);
    }

    #[test]
    fn field_diagnostic_serializes_flat() {
        let diag = FieldDiagnostic {
            field: OfferField::Expiry,
            fragment: Some("Ends 31/02/2099".into()),
            status: FieldStatus::Failed {
                error: ExtractionError::InvalidDate {
                    raw: "31/02/2099".into(),
                    layout: "%d/%m/%Y".into(),
                },
            },
        };
        let value = serde_json::to_value(&diag).unwrap();
        assert_eq!(value["field"], "expiry");
        assert_eq!(value["status"], "failed");
        assert_eq!(value["error"]["kind"], "invalid_date");
    }
}
