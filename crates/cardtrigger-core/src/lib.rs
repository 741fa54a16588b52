//! Shared policy model and configuration for cardtrigger.
//!
//! This crate owns everything that is decided before the first card is
//! seen: the certificate policy (which actions fire for which certificate
//! subject on which card event), the ATR table used to name card types, and
//! the monitor tuning knobs. All of it is loaded once from TOML, validated in
//! a single step and read-only afterwards.
//!
//! # Examples
//!
//! ```
//! use cardtrigger_core::{CardTriggerConfig, EventFlags};
//!
//! let config = CardTriggerConfig::from_toml(
//!     r#"
//!     [[certificates]]
//!     subject = "CN=Alice"
//!
//!     [[certificates.actions]]
//!     on = "insert,remove"
//!     target = "lockworkstation"
//!     require_pin = false
//!     "#,
//! )
//! .unwrap();
//!
//! let entry = &config.policy.entries()[0];
//! assert_eq!(entry.subject(), "CN=Alice");
//! assert_eq!(entry.actions()[0].on(), EventFlags::INSERT | EventFlags::REMOVE);
//! ```

pub mod card_types;
pub mod config;
pub mod error;
pub mod policy;

pub use card_types::{AtrPattern, CardTypeTable};
pub use config::{CardTriggerConfig, MonitorSettings};
pub use error::{Error, Result};
pub use policy::{ActionConfig, CertificatePolicy, EventFlags, Parameter, Parameters, Policy};

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
