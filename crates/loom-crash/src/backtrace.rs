// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Backtrace capture and parsing, and conversion of error chains into
//! exceptions.

use std::backtrace::Backtrace;
use std::error::Error;

use loom_crash_core::{Exception, Frame, Stacktrace};
use rustc_demangle::demangle;

/// Frames at the top of a capture that belong to the capture machinery
/// rather than to the failure.
const CAPTURE_PREFIXES: &[&str] = &[
	"std::backtrace",
	"<std::backtrace",
	"std::panicking",
	"<std::panicking",
	"core::panicking",
	"std::panic::",
	"<alloc::boxed::Box<F,A> as core::ops::function::Fn",
	"loom_crash::",
	"<loom_crash::",
	"rust_begin_unwind",
	"__rustc::rust_begin_unwind",
];

const SYSTEM_PREFIXES: &[&str] = &[
	"std::",
	"core::",
	"alloc::",
	"<std::",
	"<core::",
	"<alloc::",
	"tokio::",
	"<tokio::",
	"futures::",
	"<futures::",
	"async_trait::",
	"tracing::",
	"<tracing::",
	"backtrace::",
	"<backtrace::",
	"panic_unwind::",
	"rust_begin_unwind",
	"rust_panic",
	"__rust_",
	"_rust_",
	"__libc_start",
	"_start",
];

const SYSTEM_CONTAINS: &[&str] = &["::panicking::", "::sys_common::", "::rt::lang_start"];

/// Decides which frames are the host application's own code.
#[derive(Debug, Clone, Default)]
pub struct FrameClassifier {
	project_packages: Vec<String>,
}

impl FrameClassifier {
	/// With no packages configured, anything outside the standard library
	/// and common runtime crates counts as project code.
	pub fn new(project_packages: Vec<String>) -> Self {
		Self { project_packages }
	}

	pub fn in_project(&self, function: &str) -> bool {
		if !self.project_packages.is_empty() {
			let bare = function.trim_start_matches('<');
			return self
				.project_packages
				.iter()
				.any(|pkg| bare == pkg || bare.starts_with(&format!("{pkg}::")));
		}
		!SYSTEM_PREFIXES.iter().any(|p| function.starts_with(p))
			&& !SYSTEM_CONTAINS.iter().any(|c| function.contains(c))
	}
}

/// Captures the current thread's stack, dropping capture frames.
pub fn capture_stacktrace(classifier: &FrameClassifier) -> Stacktrace {
	stacktrace_from_rendered(&render_backtrace(), classifier)
}

/// The `{:#}` rendering of the current thread's stack.
pub fn render_backtrace() -> String {
	format!("{:#}", Backtrace::force_capture())
}

/// Parses a rendering from [`render_backtrace`], possibly taken on another
/// thread, dropping capture frames.
pub fn stacktrace_from_rendered(text: &str, classifier: &FrameClassifier) -> Stacktrace {
	let mut stacktrace = parse_backtrace(text, classifier);
	trim_capture_frames(&mut stacktrace);
	stacktrace
}

/// Parses the `{:#}` rendering of a [`Backtrace`]:
///
/// ```text
///    0: my_app::main
///              at ./src/main.rs:10:5
/// ```
pub fn parse_backtrace(text: &str, classifier: &FrameClassifier) -> Stacktrace {
	let mut frames: Vec<Frame> = Vec::new();

	for line in text.lines() {
		let line = line.trim();
		if line.is_empty() {
			continue;
		}

		if let Some(location) = line.strip_prefix("at ") {
			if let Some(frame) = frames.last_mut() {
				if frame.file.is_none() {
					apply_location(frame, location);
				}
			}
			continue;
		}

		if let Some(frame) = parse_frame_line(line, classifier) {
			frames.push(frame);
		}
	}

	Stacktrace { frames }
}

fn parse_frame_line(line: &str, classifier: &FrameClassifier) -> Option<Frame> {
	let function = match line.split_once(':') {
		Some((index, rest)) if index.trim().parse::<u32>().is_ok() => rest.trim(),
		_ => line,
	};
	if function.is_empty() || function == "<unknown>" {
		return None;
	}

	let demangled = demangle(function).to_string();
	let module = demangled
		.rfind("::")
		.map(|idx| demangled[..idx].trim_start_matches('<').to_string())
		.filter(|m| !m.is_empty());

	Some(Frame {
		in_project: classifier.in_project(&demangled),
		function: Some(demangled),
		module,
		..Frame::default()
	})
}

/// `path:line:col`, where the path itself may contain colons.
fn apply_location(frame: &mut Frame, location: &str) {
	let mut parts = location.rsplitn(3, ':');
	let col = parts.next().and_then(|s| s.parse::<u32>().ok());
	let line = parts.next().and_then(|s| s.parse::<u32>().ok());
	match (line, col, parts.next()) {
		(Some(line), Some(col), Some(file)) => {
			frame.file = Some(file.to_string());
			frame.line_number = Some(line);
			frame.column_number = Some(col);
		}
		_ => frame.file = Some(location.to_string()),
	}
}

fn trim_capture_frames(stacktrace: &mut Stacktrace) {
	let skip = stacktrace
		.frames
		.iter()
		.take_while(|frame| {
			frame
				.function
				.as_deref()
				.map(|f| CAPTURE_PREFIXES.iter().any(|p| f.starts_with(p)))
				.unwrap_or(false)
		})
		.count();
	// Keep everything rather than nothing.
	if skip < stacktrace.frames.len() {
		stacktrace.frames.drain(..skip);
	}
}

/// Builds the exception list for `err`: the error itself first, then each
/// `source()` in turn. Only the top exception carries the stack trace.
pub fn exception_chain(err: &(dyn Error + 'static), top_class: &str, stacktrace: Stacktrace) -> Vec<Exception> {
	let mut exceptions = vec![Exception::new(top_class, err.to_string(), stacktrace)];
	let mut source = err.source();
	while let Some(cause) = source {
		exceptions.push(Exception::new(
			debug_class_name(cause),
			cause.to_string(),
			Stacktrace::default(),
		));
		source = cause.source();
	}
	exceptions
}

/// Best-effort class name for a type-erased error: the leading identifier of
/// its `Debug` output, as derived `Debug` prints the type or variant name.
fn debug_class_name(err: &dyn Error) -> String {
	let debug = format!("{err:?}");
	let ident: String = debug
		.chars()
		.take_while(|c| c.is_alphanumeric() || *c == '_' || *c == ':')
		.collect();
	if ident.is_empty() || !ident.starts_with(|c: char| c.is_alphabetic()) {
		"Error".to_string()
	} else {
		ident
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const SAMPLE: &str = "   0: std::backtrace::Backtrace::force_capture
             at /rustc/abc/library/std/src/backtrace.rs:312:13
   1: loom_crash::backtrace::capture_stacktrace
             at ./src/backtrace.rs:80:18
   2: my_app::handlers::process
             at ./src/handlers.rs:42:9
   3: core::ops::function::FnOnce::call_once
             at /rustc/abc/library/core/src/ops/function.rs:250:5
   4: <unknown>";

	#[test]
	fn system_frames_are_not_project() {
		let classifier = FrameClassifier::default();
		assert!(!classifier.in_project("std::panic::panic_any"));
		assert!(!classifier.in_project("core::panicking::panic"));
		assert!(!classifier.in_project("alloc::vec::Vec::push"));
		assert!(!classifier.in_project("tokio::runtime::Runtime::block_on"));
		assert!(classifier.in_project("my_app::main"));
	}

	#[test]
	fn project_packages_restrict_classification() {
		let classifier = FrameClassifier::new(vec!["my_app".to_string()]);
		assert!(classifier.in_project("my_app::main"));
		assert!(classifier.in_project("<my_app::Handler as Trait>::call"));
		assert!(!classifier.in_project("my_application::main"));
		assert!(!classifier.in_project("serde::de::from_str"));
	}

	#[test]
	fn parses_frames_and_locations() {
		let stacktrace = parse_backtrace(SAMPLE, &FrameClassifier::default());
		assert_eq!(stacktrace.frames.len(), 4);

		let app = &stacktrace.frames[2];
		assert_eq!(app.function.as_deref(), Some("my_app::handlers::process"));
		assert_eq!(app.module.as_deref(), Some("my_app::handlers"));
		assert_eq!(app.file.as_deref(), Some("./src/handlers.rs"));
		assert_eq!(app.line_number, Some(42));
		assert_eq!(app.column_number, Some(9));
		assert!(app.in_project);
		assert!(!stacktrace.frames[3].in_project);
	}

	#[test]
	fn trims_capture_frames() {
		let mut stacktrace = parse_backtrace(SAMPLE, &FrameClassifier::default());
		trim_capture_frames(&mut stacktrace);
		assert_eq!(
			stacktrace.frames[0].function.as_deref(),
			Some("my_app::handlers::process")
		);
	}

	#[derive(Debug)]
	struct Outer(std::io::Error);

	impl std::fmt::Display for Outer {
		fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
			write!(f, "config load failed")
		}
	}

	impl Error for Outer {
		fn source(&self) -> Option<&(dyn Error + 'static)> {
			Some(&self.0)
		}
	}

	#[test]
	fn exception_chain_follows_sources() {
		let err = Outer(std::io::Error::new(std::io::ErrorKind::NotFound, "missing file"));
		let exceptions = exception_chain(&err, "my_app::Outer", Stacktrace::default());

		assert_eq!(exceptions.len(), 2);
		assert_eq!(exceptions[0].error_class, "my_app::Outer");
		assert_eq!(exceptions[0].message, "config load failed");
		assert_eq!(exceptions[1].error_class, "Custom");
		assert_eq!(exceptions[1].message, "missing file");
	}

	#[test]
	fn capture_does_not_panic() {
		let _ = capture_stacktrace(&FrameClassifier::default());
	}
}
