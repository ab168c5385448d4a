//! pijs_env - disposable per-test JavaScript environments
//!
//! Every test file gets a brand-new browser-like global scope (a QuickJS
//! context with `window`, `document`, `location`, `navigator`) so state never
//! leaks between tests, plus:
//! - Evaluation under a logical file name, directly or through a
//!   `<script src>` resource load
//! - Fake timers installed by default, with a real-timer escape hatch
//! - Process-level `Buffer`/`process`/`setImmediate` shared from one [`Host`]
//!
//! ```no_run
//! use pijs_env::{EnvironmentConfig, Host, HostOptions, TestEnvironment};
//!
//! # fn main() -> pijs_env::Result<()> {
//! let host = Host::new(HostOptions::default())?;
//! let mut env = TestEnvironment::new(host, EnvironmentConfig::new("http://localhost/"))?;
//! env.run_source_text("window.__x = 1 + 1;", "sum.test.js")?;
//! env.run_all_timers()?;
//! env.dispose();
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![cfg_attr(
    test,
    allow(
        clippy::match_same_arms,
        clippy::uninlined_format_args,
        clippy::missing_const_for_fn
    )
)]
#![allow(
    clippy::must_use_candidate,
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions
)]

pub mod buffer_shim;
pub mod cli;
pub mod config;
pub mod convert;
pub mod environment;
pub mod error;
pub mod fake_timers;
pub mod host;
pub mod scheduler;
pub mod scope;
pub mod timer_bridge;

pub use config::{EnvironmentConfig, EvaluationStrategy};
pub use environment::{PendingScript, TestEnvironment};
pub use error::{Error, Result};
pub use fake_timers::FakeTimers;
pub use host::{Host, HostOptions};
pub use scope::{
    ResourceCallback, ResourceKind, ResourceLoader, ResourceRequest, Scope, ScopeFeatures,
};
