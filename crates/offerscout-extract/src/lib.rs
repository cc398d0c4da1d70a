//! Locating offer containers in a fetched page and turning their fragments into validated
//! candidates.

use chrono::{Days, NaiveDate};
use offerscout_core::{
    CandidateRecord, ConfigError, ExtractionError, ExtractionPatterns, FieldDiagnostic, FieldStatus,
    LocationPatterns, OfferField, OfferFields, RunOptions, SourceConfig, ValidationError,
};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "offerscout-extract";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LocateError {
    #[error("invalid selector for `{key}`: {reason}")]
    InvalidSelector { key: &'static str, reason: String },
}

impl From<LocateError> for ConfigError {
    fn from(err: LocateError) -> Self {
        match err {
            LocateError::InvalidSelector { key, reason } => {
                ConfigError::InvalidSelector { key, reason }
            }
        }
    }
}

/// Text of one container and of each field element found inside it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContainerFragment {
    pub index: usize,
    pub text: String,
    pub name: Option<String>,
    pub reward_amount: Option<String>,
    pub requirements: Option<String>,
    pub expiry: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LocationSelectors {
    container: Selector,
    name: Selector,
    reward_amount: Selector,
    requirements: Option<Selector>,
    expiry: Option<Selector>,
}

fn parse_selector(key: &'static str, raw: &str) -> Result<Selector, LocateError> {
    Selector::parse(raw).map_err(|e| LocateError::InvalidSelector {
        key,
        reason: e.to_string(),
    })
}

fn parse_optional_selector(
    key: &'static str,
    raw: Option<&str>,
) -> Result<Option<Selector>, LocateError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => parse_selector(key, raw).map(Some),
        None => Ok(None),
    }
}

/// Trimmed text with internal whitespace runs collapsed; empty text counts as absent.
fn normalized_text(element: ElementRef<'_>) -> Option<String> {
    let raw = element.text().collect::<String>();
    let text = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn first_text_within(container: ElementRef<'_>, selector: Option<&Selector>) -> Option<String> {
    let selector = selector?;
    container.select(selector).next().and_then(normalized_text)
}

impl LocationSelectors {
    pub fn compile(patterns: &LocationPatterns) -> Result<Self, LocateError> {
        Ok(Self {
            container: parse_selector("location_patterns.container", &patterns.container)?,
            name: parse_selector("location_patterns.name", &patterns.name)?,
            reward_amount: parse_selector(
                "location_patterns.reward_amount",
                &patterns.reward_amount,
            )?,
            requirements: parse_optional_selector(
                "location_patterns.requirements",
                patterns.requirements.as_deref(),
            )?,
            expiry: parse_optional_selector(
                "location_patterns.expiry",
                patterns.expiry.as_deref(),
            )?,
        })
    }

    /// Containers in document order. Field selectors only see the inside of their container.
    pub fn locate(&self, document: &str) -> Vec<ContainerFragment> {
        let html = Html::parse_document(document);
        html.select(&self.container)
            .enumerate()
            .map(|(index, container)| ContainerFragment {
                index,
                text: normalized_text(container).unwrap_or_default(),
                name: first_text_within(container, Some(&self.name)),
                reward_amount: first_text_within(container, Some(&self.reward_amount)),
                requirements: first_text_within(container, self.requirements.as_ref()),
                expiry: first_text_within(container, self.expiry.as_ref()),
            })
            .collect()
    }
}

/// Zero containers is a valid result; only an unparsable selector fails.
pub fn locate(
    document: &str,
    patterns: &LocationPatterns,
) -> Result<Vec<ContainerFragment>, LocateError> {
    Ok(LocationSelectors::compile(patterns)?.locate(document))
}

#[derive(Debug, Clone)]
pub struct FieldPatterns {
    reward_amount: Regex,
    requirements_count: Regex,
    pay_in: Regex,
    expiry: Regex,
    date_layout: String,
}

fn compile_pattern(key: &'static str, raw: &str) -> Result<Regex, ConfigError> {
    let regex = Regex::new(raw).map_err(|e| ConfigError::InvalidPattern {
        key,
        reason: e.to_string(),
    })?;
    let found = regex.captures_len() - 1;
    if found != 1 {
        return Err(ConfigError::CaptureGroups { key, found });
    }
    Ok(regex)
}

impl FieldPatterns {
    pub fn compile(patterns: &ExtractionPatterns) -> Result<Self, ConfigError> {
        Ok(Self {
            reward_amount: compile_pattern(
                "extraction_patterns.reward_amount_pattern",
                &patterns.reward_amount_pattern,
            )?,
            requirements_count: compile_pattern(
                "extraction_patterns.requirements_count_pattern",
                &patterns.requirements_count_pattern,
            )?,
            pay_in: compile_pattern(
                "extraction_patterns.pay_in_pattern",
                &patterns.pay_in_pattern,
            )?,
            expiry: compile_pattern(
                "extraction_patterns.expiry_pattern",
                &patterns.expiry_pattern,
            )?,
            date_layout: patterns.date_layout.clone(),
        })
    }
}

/// Everything a run needs from a config, compiled once before any fetch.
#[derive(Debug, Clone)]
pub struct CompiledPatterns {
    pub location: LocationSelectors,
    pub fields: FieldPatterns,
}

impl CompiledPatterns {
    pub fn compile(config: &SourceConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            location: LocationSelectors::compile(&config.location_patterns)?,
            fields: FieldPatterns::compile(&config.extraction_patterns)?,
        })
    }
}

/// First capture group of `pattern` in `fragment`, or `None` when the pattern does not match.
pub fn capture(fragment: &str, pattern: &Regex) -> Option<String> {
    pattern
        .captures(fragment)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
}

pub fn coerce_amount(raw: &str) -> Result<f64, ExtractionError> {
    let cleaned: String = raw.chars().filter(|c| *c != ',' && !c.is_whitespace()).collect();
    match cleaned.parse::<f64>() {
        Ok(value) if value.is_finite() && value >= 0.0 => Ok(value),
        _ => Err(ExtractionError::InvalidAmount {
            raw: raw.to_string(),
        }),
    }
}

pub fn coerce_count(raw: &str) -> Result<u32, ExtractionError> {
    raw.trim().parse::<u32>().map_err(|_| ExtractionError::InvalidAmount {
        raw: raw.to_string(),
    })
}

pub fn coerce_date(raw: &str, layout: &str) -> Result<NaiveDate, ExtractionError> {
    NaiveDate::parse_from_str(raw.trim(), layout).map_err(|_| ExtractionError::InvalidDate {
        raw: raw.to_string(),
        layout: layout.to_string(),
    })
}

fn diagnostic(field: OfferField, fragment: Option<&str>, status: FieldStatus) -> FieldDiagnostic {
    if let FieldStatus::Failed { error } = &status {
        debug!(field = %field, %error, "field extraction failed");
    }
    FieldDiagnostic {
        field,
        fragment: fragment.map(str::to_string),
        status,
    }
}

fn extract_name(fragment: &ContainerFragment) -> (Option<String>, FieldDiagnostic) {
    match fragment.name.as_deref() {
        Some(name) => (
            Some(name.to_string()),
            diagnostic(
                OfferField::Name,
                Some(name),
                FieldStatus::Extracted {
                    value: name.to_string(),
                },
            ),
        ),
        None => (
            None,
            diagnostic(
                OfferField::Name,
                None,
                FieldStatus::Failed {
                    error: ExtractionError::FieldNotFound,
                },
            ),
        ),
    }
}

fn extract_reward(
    fragment: &ContainerFragment,
    patterns: &FieldPatterns) -> (Option<f64>, FieldDiagnostic,
) {
    let raw = fragment.reward_amount.as_deref();
    let outcome = raw
        .and_then(|text| capture(text, &patterns.reward_amount))
        .ok_or(ExtractionError::FieldNotFound)
        .and_then(|captured| coerce_amount(&captured));
    match outcome {
        Ok(amount) => (
            Some(amount),
            diagnostic(
                OfferField::RewardAmount,
                raw,
                FieldStatus::Extracted {
                    value: amount.to_string(),
                },
            ),
        ),
        Err(error) => (
            None,
            diagnostic(OfferField::RewardAmount, raw, FieldStatus::Failed { error }),
        ),
    }
}

fn extract_required_payments(
    fragment: &ContainerFragment,
    patterns: &FieldPatterns) -> (u32, FieldDiagnostic,
) {
    let raw = fragment.requirements.as_deref();
    let Some(captured) = raw.and_then(|text| capture(text, &patterns.requirements_count)) else {
        return (
            0,
            diagnostic(
                OfferField::RequiredPayments,
                raw,
                FieldStatus::Defaulted {
                    value: "0".to_string(),
                },
            ),
        );
    };
    match coerce_count(&captured) {
        Ok(count) => (
            count,
            diagnostic(
                OfferField::RequiredPayments,
                raw,
                FieldStatus::Extracted {
                    value: count.to_string(),
                },
            ),
        ),
        Err(error) => (
            0,
            diagnostic(OfferField::RequiredPayments, raw, FieldStatus::Failed { error }),
        ),
    }
}

fn extract_pay_in(
    fragment: &ContainerFragment,
    patterns: &FieldPatterns) -> (Option<f64>, FieldDiagnostic,
) {
    let raw = fragment.requirements.as_deref();
    let Some(captured) = raw.and_then(|text| capture(text, &patterns.pay_in)) else {
        return (
            None,
            diagnostic(
                OfferField::PayInThreshold,
                raw,
                FieldStatus::Defaulted {
                    value: "none".to_string(),
                },
            ),
        );
    };
    match coerce_amount(&captured) {
        Ok(amount) => (
            Some(amount),
            diagnostic(
                OfferField::PayInThreshold,
                raw,
                FieldStatus::Extracted {
                    value: amount.to_string(),
                },
            ),
        ),
        Err(error) => (
            None,
            diagnostic(OfferField::PayInThreshold, raw, FieldStatus::Failed { error }),
        ),
    }
}

fn extract_expiry(
    fragment: &ContainerFragment,
    patterns: &FieldPatterns) -> (Option<NaiveDate>, FieldDiagnostic,
) {
    let raw = fragment.expiry.as_deref();
    let Some(captured) = raw.and_then(|text| capture(text, &patterns.expiry)) else {
        return (
            None,
            diagnostic(
                OfferField::Expiry,
                raw,
                FieldStatus::Defaulted {
                    value: "none".to_string(),
                },
            ),
        );
    };
    match coerce_date(&captured, &patterns.date_layout) {
        Ok(date) => (
            Some(date),
            diagnostic(
                OfferField::Expiry,
                raw,
                FieldStatus::Extracted {
                    value: date.to_string(),
                },
            ),
        ),
        Err(error) => (None, diagnostic(OfferField::Expiry, raw, FieldStatus::Failed { error })),
    }
}

/// Secondary checks on a structurally complete offer.
pub fn validate_offer(
    offer: &OfferFields,
    options: &RunOptions,
    today: NaiveDate,
) -> Vec<ValidationError> {
    let mut defects = Vec::new();
    if offer.reward_amount <= 0.0 {
        defects.push(ValidationError::NonPositiveAmount {
            amount: offer.reward_amount,
        });
    }
    if let Some(expiry) = offer.expiry {
        let cutoff = today
            .checked_sub_days(Days::new(u64::from(options.expiry_grace_days)))
            .unwrap_or(NaiveDate::MIN);
        if expiry < cutoff {
            defects.push(ValidationError::StaleExpiry { expiry, cutoff });
        }
    }
    defects
}

/// Attempts every field of one container, then builds the offer only if name and reward both
/// succeeded.
pub fn assemble(
    fragment: &ContainerFragment,
    patterns: &FieldPatterns,
    options: &RunOptions,
    today: NaiveDate,
) -> CandidateRecord {
    let (name, name_diag) = extract_name(fragment);
    let (reward, reward_diag) = extract_reward(fragment, patterns);
    let (required_payments, payments_diag) = extract_required_payments(fragment, patterns);
    let (pay_in_threshold, pay_in_diag) = extract_pay_in(fragment, patterns);
    let (expiry, expiry_diag) = extract_expiry(fragment, patterns);
    let diagnostics = vec![name_diag, reward_diag, payments_diag, pay_in_diag, expiry_diag];

    let mut defects = Vec::new();
    if name.is_none() {
        defects.push(ValidationError::MissingMandatoryField {
            field: OfferField::Name,
        });
    }
    if reward.is_none() {
        defects.push(ValidationError::MissingMandatoryField {
            field: OfferField::RewardAmount,
        });
    }

    let offer = match (name, reward) {
        (Some(name), Some(reward_amount)) => {
            let offer = OfferFields {
                name,
                reward_amount,
                required_payments,
                pay_in_threshold,
                expiry,
            };
            defects.extend(validate_offer(&offer, options, today));
            Some(offer)
        }
        _ => None,
    };

    CandidateRecord {
        container_index: fragment.index,
        offer,
        diagnostics,
        defects,
    }
}

/// Locate, extract and validate every container of `document`.
pub fn extract_candidates(
    document: &str,
    patterns: &CompiledPatterns,
    options: &RunOptions,
    today: NaiveDate,
) -> Vec<CandidateRecord> {
    patterns
        .location
        .locate(document)
        .iter()
        .map(|fragment| assemble(fragment, &patterns.fields, options, today))
        .collect()
}
