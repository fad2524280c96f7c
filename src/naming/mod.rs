//! Resource naming
//!
//! Every resource a run creates is named `<prefix>-[<component>-]<suffix>`.
//! The suffix is either pinned by configuration or generated once per
//! [`ResourceNamer`], so all resources of a run form one correlated group that
//! a cleanup sweep can find again from the prefix and suffix alone.

use chrono::Utc;
use std::collections::HashSet;
use std::sync::{Mutex, OnceLock};
use thiserror::Error;
use tracing::debug;

/// Longest name Kubernetes and Compute accept for the resources we create
pub const MAX_NAME_LEN: usize = 63;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NamingError {
    #[error("invalid resource prefix '{0}': use lowercase letters, digits and '-', starting with a letter")]
    InvalidPrefix(String),

    #[error("invalid resource suffix '{0}': use lowercase letters, digits and '-'")]
    InvalidSuffix(String),

    #[error("resource name '{name}' is longer than {} characters", MAX_NAME_LEN)]
    TooLong { name: String },
}

/// How the suffix of a run is chosen
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SuffixPolicy {
    /// Pinned suffix; names are reproducible across runs
    Fixed(String),
    /// Generated once per namer
    Random,
}

impl SuffixPolicy {
    /// Unset or blank means random
    pub fn from_option(suffix: Option<&str>) -> Self {
        match suffix.map(str::trim) {
            Some(s) if !s.is_empty() => SuffixPolicy::Fixed(s.to_string()),
            _ => SuffixPolicy::Random,
        }
    }

    pub fn is_pinned(&self) -> bool {
        matches!(self, SuffixPolicy::Fixed(_))
    }
}

/// Prefix plus suffix policy
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NameTemplate {
    pub prefix: String,
    pub suffix: SuffixPolicy,
}

impl NameTemplate {
    pub fn new(prefix: impl Into<String>, suffix: SuffixPolicy) -> Self {
        Self {
            prefix: prefix.into(),
            suffix,
        }
    }
}

/// `prefix-suffix`; a random policy draws a fresh suffix on every call
pub fn compute_name(prefix: &str, suffix: &SuffixPolicy) -> String {
    match suffix {
        SuffixPolicy::Fixed(s) => format!("{prefix}-{s}"),
        SuffixPolicy::Random => format!("{prefix}-{}", generate_suffix()),
    }
}

fn seen_suffixes() -> &'static Mutex<HashSet<String>> {
    static SEEN: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    SEEN.get_or_init(|| Mutex::new(HashSet::new()))
}

fn remember(suffix: &str) -> bool {
    match seen_suffixes().lock() {
        Ok(mut seen) => seen.insert(suffix.to_string()),
        Err(poisoned) => poisoned.into_inner().insert(suffix.to_string()),
    }
}

/// Generate a short suffix never handed out before in this process
///
/// Format is `YYYYMMDD-HHMM-xxxxx`: the timestamp keeps leaked resources
/// sortable by age, the random hex part separates concurrent runs.
pub fn generate_suffix() -> String {
    let timestamp = Utc::now().format("%Y%m%d-%H%M");
    loop {
        let random: u32 = rand::random::<u32>() & 0xf_ffff;
        let suffix = format!("{timestamp}-{random:05x}");
        if remember(&suffix) {
            return suffix;
        }
        debug!("Suffix {} already used in this process, drawing again", suffix);
    }
}

/// Names every resource of one run
#[derive(Clone, Debug)]
pub struct ResourceNamer {
    prefix: String,
    suffix: String,
    pinned: bool,
}

impl ResourceNamer {
    /// Validate the template and fix the run's suffix
    pub fn new(template: &NameTemplate) -> Result<Self, NamingError> {
        if !is_valid_prefix(&template.prefix) {
            return Err(NamingError::InvalidPrefix(template.prefix.clone()));
        }

        let (suffix, pinned) = match &template.suffix {
            SuffixPolicy::Fixed(s) => {
                if !is_valid_suffix(s) {
                    return Err(NamingError::InvalidSuffix(s.clone()));
                }
                remember(s);
                (s.clone(), true)
            }
            SuffixPolicy::Random => (generate_suffix(), false),
        };

        let namer = Self {
            prefix: template.prefix.clone(),
            suffix,
            pinned,
        };
        namer.check_len(&namer.base_name())?;
        Ok(namer)
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// Whether the suffix came from configuration rather than the generator
    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    fn policy(&self) -> SuffixPolicy {
        SuffixPolicy::Fixed(self.suffix.clone())
    }

    /// `prefix-suffix`
    pub fn base_name(&self) -> String {
        compute_name(&self.prefix, &self.policy())
    }

    /// `prefix-component-suffix`
    pub fn name(&self, component: &str) -> String {
        compute_name(&format!("{}-{}", self.prefix, component), &self.policy())
    }

    /// Like [`name`](Self::name) but rejects names over [`MAX_NAME_LEN`]
    pub fn checked_name(&self, component: &str) -> Result<String, NamingError> {
        let name = self.name(component);
        self.check_len(&name)?;
        Ok(name)
    }

    fn check_len(&self, name: &str) -> Result<(), NamingError> {
        if name.len() > MAX_NAME_LEN {
            return Err(NamingError::TooLong {
                name: name.to_string(),
            });
        }
        Ok(())
    }
}

fn is_valid_prefix(prefix: &str) -> bool {
    prefix.starts_with(|c: char| c.is_ascii_lowercase())
        && !prefix.ends_with('-')
        && prefix
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

fn is_valid_suffix(suffix: &str) -> bool {
    !suffix.is_empty()
        && !suffix.starts_with('-')
        && !suffix.ends_with('-')
        && suffix
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}
