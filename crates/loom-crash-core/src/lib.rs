// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Core types for the Loom crash telemetry client.
//!
//! This crate holds the value types shared by the client SDK (`loom-crash`)
//! and anything that reconstructs events from durable storage.
//!
//! # Overview
//!
//! - [`Event`]: one captured error occurrence with its context snapshots
//! - [`Breadcrumb`]: a bounded diagnostic marker preceding an event
//! - [`Session`]: handled/unhandled counters, incremented by value
//! - [`Metadata`]: free-form key/value data grouped into named sections
//! - [`Report`]: the envelope posted to the collector

pub mod breadcrumb;
pub mod error;
pub mod event;
pub mod metadata;
pub mod report;
pub mod session;
pub mod user;

pub use breadcrumb::{Breadcrumb, BreadcrumbType, MAX_MESSAGE_LEN};
pub use error::{CrashError, Result};
pub use event::{ContextMap, Event, EventId, Exception, Frame, Severity, SeverityReason, Stacktrace};
pub use metadata::Metadata;
pub use report::{Notifier, Report, SessionReport, PAYLOAD_VERSION};
pub use session::{Session, SessionEvents, SessionId};
pub use user::User;
