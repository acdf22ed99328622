// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Crash and error reporting client for Rust applications.
//!
//! Captures handled errors, panics and (on Unix) fatal signals, enriches
//! them with breadcrumbs, user, metadata and session state, and delivers
//! them to a collector. Events that cannot be sent are persisted and retried
//! on the next launch or when connectivity returns.
//!
//! # Quick Start
//!
//! ```no_run
//! use loom_crash::CrashClient;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let crash = CrashClient::builder()
//!         .api_key("your-api-key")
//!         .app_version(env!("CARGO_PKG_VERSION"))
//!         .release_stage("production")
//!         .build()?;
//!
//!     crash.leave_breadcrumb("Application started");
//!     crash.add_metadata("account", "plan", "pro");
//!
//!     if let Err(e) = risky_operation() {
//!         crash.notify_with(&e, |event| {
//!             event.context = Some("startup".into());
//!             true
//!         });
//!     }
//!
//!     crash.close();
//!     Ok(())
//! }
//!
//! fn risky_operation() -> Result<(), std::io::Error> {
//!     Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - **Panic capture**: an installed panic hook reports panics as unhandled
//!   events before the previous hook runs
//! - **Native crashes**: fatal signals are written to a bridge file and
//!   reported on the next launch
//! - **Callbacks**: on-error, on-breadcrumb and on-session chains may edit or
//!   veto what is recorded
//! - **Sessions**: handled and unhandled counts for stability scoring
//! - **Offline queue**: bounded on-disk store, flushed oldest first

pub mod backtrace;
pub mod breadcrumbs;
pub mod bus;
pub mod callbacks;
pub mod client;
pub mod config;
pub mod context;
pub mod delivery;
pub mod diagnostics;
pub mod dispatch;
pub mod error;
pub mod global;
pub mod native;
pub mod panic_hook;
pub mod session;
pub mod store;
pub mod user_store;

pub use backtrace::{capture_stacktrace, exception_chain, FrameClassifier};
pub use bus::{EventBus, StateEvent, StateEventKind, SubscriptionId};
pub use callbacks::CallbackId;
pub use client::CrashClient;
pub use config::{ClientConfig, CrashClientBuilder};
pub use context::{ContextProvider, DefaultContextProvider};
pub use delivery::{Delivery, DeliveryParams, DeliveryStatus, FlushSummary, HttpDelivery};
pub use error::{CrashSdkError, DeliveryError, Result, StoreError};
pub use session::{PausedSessionPolicy, ResumeOutcome};

pub use loom_crash_core::{
	Breadcrumb, BreadcrumbType, ContextMap, Event, EventId, Exception, Frame, Metadata, Notifier, Report, Session,
	SessionReport, Severity, SeverityReason, Stacktrace, User,
};
