//! Configuration loading and validation.
//!
//! Configuration is a single TOML document:
//!
//! ```toml
//! [monitor]
//! recovery_backoff_ms = 1000
//! cancel_retry_ms = 50
//! background_execution = false
//!
//! [[card_types]]
//! name = "YubiKey"
//! atr = "3B F8 13 00 00 81 31 FE 15 59 75 62 69 6B 65 79 34 D4"
//!
//! [[certificates]]
//! subject = "CN=Alice, O=Example"
//!
//! [[certificates.actions]]
//! on = "insert"
//! target = "volumeunlock"
//! require_pin = true
//! parameters = [
//!     { name = "target", value = "/dev/sda2" },
//!     { name = "name", value = "home" },
//! ]
//! ```
//!
//! The raw serde shapes are private. [`CardTriggerConfig::from_toml`] turns
//! them into the validated [`Policy`] and [`CardTypeTable`] in one pass and
//! fails on the first problem it finds.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::card_types::{AtrPattern, CardTypeTable};
use crate::error::{Error, Result};
use crate::policy::{ActionConfig, CertificatePolicy, EventFlags, Parameter, Parameters, Policy};

/// Default delay between attempts to re-establish the subsystem context.
pub const DEFAULT_RECOVERY_BACKOFF_MS: u64 = 1000;

/// Default interval between repeated cancel requests while stopping.
pub const DEFAULT_CANCEL_RETRY_MS: u64 = 50;

/// Monitor tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorSettings {
    /// Delay between context re-establishment attempts after the service
    /// went away.
    pub recovery_backoff: Duration,

    /// Interval between repeated cancel requests while stopping.
    pub cancel_retry: Duration,

    /// Run action batches on worker threads instead of on the monitor
    /// thread.
    pub background_execution: bool,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            recovery_backoff: Duration::from_millis(DEFAULT_RECOVERY_BACKOFF_MS),
            cancel_retry: Duration::from_millis(DEFAULT_CANCEL_RETRY_MS),
            background_execution: false,
        }
    }
}

/// Validated configuration.
#[derive(Debug, Clone, Default)]
pub struct CardTriggerConfig {
    pub monitor: MonitorSettings,
    pub card_types: CardTypeTable,
    pub policy: Policy,
}

impl CardTriggerConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&content)?;
        debug!(
            path = %path.display(),
            certificates = config.policy.entries().len(),
            card_types = config.card_types.patterns().len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The TOML is invalid or has unknown keys
    /// - An `on` value has an unknown or empty token
    /// - An action omits `require_pin`
    /// - A subject or target is blank
    /// - A card type ATR or mask is malformed
    pub fn from_toml(content: &str) -> Result<Self> {
        let raw: RawConfig = toml::from_str(content)?;
        raw.validate()
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    monitor: RawMonitor,

    #[serde(default)]
    card_types: Vec<RawCardType>,

    #[serde(default)]
    certificates: Vec<RawCertificate>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawMonitor {
    recovery_backoff_ms: Option<u64>,
    cancel_retry_ms: Option<u64>,
    #[serde(default)]
    background_execution: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCardType {
    name: String,
    atr: String,
    mask: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCertificate {
    subject: String,
    #[serde(default)]
    actions: Vec<RawAction>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAction {
    on: String,
    target: String,
    require_pin: Option<bool>,
    #[serde(default)]
    parameters: Vec<RawParameter>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawParameter {
    name: String,
    value: String,
}

impl RawConfig {
    fn validate(self) -> Result<CardTriggerConfig> {
        let monitor = self.monitor.validate()?;

        let card_types = self
            .card_types
            .into_iter()
            .map(|ct| AtrPattern::from_hex(ct.name, &ct.atr, ct.mask.as_deref()))
            .collect::<Result<Vec<_>>>()?;

        let entries = self
            .certificates
            .into_iter()
            .map(RawCertificate::validate)
            .collect::<Result<Vec<_>>>()?;

        Ok(CardTriggerConfig {
            monitor,
            card_types: CardTypeTable::new(card_types),
            policy: Policy::new(entries),
        })
    }
}

impl RawMonitor {
    fn validate(self) -> Result<MonitorSettings> {
        let recovery_backoff_ms = self
            .recovery_backoff_ms
            .unwrap_or(DEFAULT_RECOVERY_BACKOFF_MS);
        let cancel_retry_ms = self.cancel_retry_ms.unwrap_or(DEFAULT_CANCEL_RETRY_MS);

        if cancel_retry_ms == 0 {
            return Err(Error::Validation(
                "monitor.cancel_retry_ms must be greater than zero".to_string(),
            ));
        }

        Ok(MonitorSettings {
            recovery_backoff: Duration::from_millis(recovery_backoff_ms),
            cancel_retry: Duration::from_millis(cancel_retry_ms),
            background_execution: self.background_execution,
        })
    }
}

impl RawCertificate {
    fn validate(self) -> Result<CertificatePolicy> {
        if self.subject.trim().is_empty() {
            return Err(Error::EmptySubject);
        }

        let subject = self.subject;
        let actions = self
            .actions
            .into_iter()
            .map(|action| action.validate(&subject))
            .collect::<Result<Vec<_>>>()?;

        CertificatePolicy::new(subject, actions)
    }
}

impl RawAction {
    fn validate(self, subject: &str) -> Result<ActionConfig> {
        if self.target.trim().is_empty() {
            return Err(Error::EmptyTarget {
                subject: subject.to_string(),
            });
        }

        let on: EventFlags = self.on.parse()?;

        let require_pin = self.require_pin.ok_or_else(|| Error::MissingRequirePin {
            subject: subject.to_string(),
            target: self.target.clone(),
        })?;

        let parameters = Parameters::new(
            self.parameters
                .into_iter()
                .map(|p| Parameter::new(p.name, p.value))
                .collect(),
        );

        ActionConfig::new(on, self.target, require_pin, parameters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const FULL: &str = r#"
        [monitor]
        recovery_backoff_ms = 250
        cancel_retry_ms = 20
        background_execution = true

        [[card_types]]
        name = "YubiKey"
        atr = "3B F8 13 00 00 81 31 FE 15 59 75 62 69 6B 65 79 34 D4"

        [[card_types]]
        name = "Masked"
        atr = "3B 8F 80 01"
        mask = "FF FF 00 FF"

        [[certificates]]
        subject = "CN=Alice, O=Example"

        [[certificates.actions]]
        on = "insert"
        target = "volumeunlock"
        require_pin = true
        parameters = [
            { name = "target", value = "/dev/sda2" },
            { name = "name", value = "home" },
        ]

        [[certificates.actions]]
        on = "remove"
        target = "lockworkstation"
        require_pin = false

        [[certificates]]
        subject = "CN=Bob"
    "#;

    #[test]
    fn test_full_config() {
        let config = CardTriggerConfig::from_toml(FULL).unwrap();

        assert_eq!(config.monitor.recovery_backoff, Duration::from_millis(250));
        assert_eq!(config.monitor.cancel_retry, Duration::from_millis(20));
        assert!(config.monitor.background_execution);

        assert_eq!(config.card_types.patterns().len(), 2);
        assert_eq!(
            config.card_types.card_types_for_atr(&[0x3B, 0x8F, 0x42, 0x01]),
            vec!["Masked"]
        );

        let entries = config.policy.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].subject(), "CN=Alice, O=Example");
        assert!(entries[1].actions().is_empty());

        let unlock = &entries[0].actions()[0];
        assert_eq!(unlock.target(), "volumeunlock");
        assert!(unlock.require_pin());
        assert_eq!(unlock.on(), EventFlags::INSERT);
        let names: Vec<_> = unlock.parameters().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["target", "name"]);
        assert_eq!(unlock.parameters().get("name"), Some("home"));
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = CardTriggerConfig::from_toml("").unwrap();
        assert_eq!(config.monitor, MonitorSettings::default());
        assert!(config.policy.is_empty());
        assert!(config.card_types.is_empty());
    }

    #[test]
    fn test_missing_require_pin_is_rejected() {
        let toml = r#"
            [[certificates]]
            subject = "CN=Alice"

            [[certificates.actions]]
            on = "insert"
            target = "volumeunlock"
        "#;

        let err = CardTriggerConfig::from_toml(toml).unwrap_err();
        assert!(matches!(
            err,
            Error::MissingRequirePin { ref subject, ref target }
                if subject == "CN=Alice" && target == "volumeunlock"
        ));
    }

    #[test]
    fn test_unknown_event_token_is_rejected() {
        let toml = r#"
            [[certificates]]
            subject = "CN=Alice"

            [[certificates.actions]]
            on = "insert|eject"
            target = "lockworkstation"
            require_pin = false
        "#;

        let err = CardTriggerConfig::from_toml(toml).unwrap_err();
        assert!(matches!(err, Error::InvalidEventFlags { ref token, .. } if token == "eject"));
    }

    #[test]
    fn test_blank_target_is_rejected() {
        let toml = r#"
            [[certificates]]
            subject = "CN=Alice"

            [[certificates.actions]]
            on = "insert"
            target = ""
            require_pin = false
        "#;

        let err = CardTriggerConfig::from_toml(toml).unwrap_err();
        assert!(matches!(err, Error::EmptyTarget { ref subject } if subject == "CN=Alice"));
    }

    #[test]
    fn test_blank_subject_is_rejected() {
        let toml = r#"
            [[certificates]]
            subject = "   "
        "#;

        let err = CardTriggerConfig::from_toml(toml).unwrap_err();
        assert!(matches!(err, Error::EmptySubject));
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let toml = r#"
            [[certificates]]
            subject = "CN=Alice"
            comment = "typo"
        "#;

        let err = CardTriggerConfig::from_toml(toml).unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn test_zero_cancel_retry_is_rejected() {
        let toml = r#"
            [monitor]
            cancel_retry_ms = 0
        "#;

        let err = CardTriggerConfig::from_toml(toml).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(FULL.as_bytes()).unwrap();

        let config = CardTriggerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.policy.entries().len(), 2);
    }

    #[test]
    fn test_from_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = CardTriggerConfig::from_file(&dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
