// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Stack capture for manual reports.

use loom_report_core::Frame;
use rustc_demangle::demangle;
use std::backtrace::Backtrace;

/// Crate prefixes that belong to the runtime rather than the application.
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
	"loom_report_agent::",
	"__rust_",
	"_start",
	"__libc_",
];

/// Captures the current thread's stack.
pub fn capture_frames() -> Vec<Frame> {
	parse_backtrace(&format!("{}", Backtrace::force_capture()))
}

/// Parses the `Display` output of a [`Backtrace`].
///
/// Frames look like `  4: symbol` optionally followed by
/// `             at path/to/file.rs:12:5`.
pub fn parse_backtrace(text: &str) -> Vec<Frame> {
	let mut frames: Vec<Frame> = Vec::new();

	for line in text.lines() {
		let line = line.trim();
		if line.is_empty() {
			continue;
		}

		if let Some(location) = line.strip_prefix("at ") {
			if let Some(frame) = frames.last_mut() {
				apply_location(frame, location);
			}
			continue;
		}

		let Some((index, symbol)) = line.split_once(": ") else {
			continue;
		};
		if index.trim().parse::<u32>().is_err() {
			continue;
		}

		let function = demangle(symbol.trim()).to_string();
		let module = function.rfind("::").map(|idx| function[..idx].to_string());
		let in_app = is_in_app(&function);
		frames.push(Frame {
			function: Some(function),
			module,
			filename: None,
			lineno: None,
			in_app,
		});
	}

	frames
}

fn apply_location(frame: &mut Frame, location: &str) {
	// path:line:column, where the path itself may contain ':' on Windows.
	let mut parts = location.rsplitn(3, ':');
	let _column = parts.next();
	let line = parts.next().and_then(|l| l.parse().ok());
	match (parts.next(), line) {
		(Some(file), Some(line)) => {
			frame.filename = Some(file.to_string());
			frame.lineno = Some(line);
		}
		_ => frame.filename = Some(location.to_string()),
	}
}

fn is_in_app(function: &str) -> bool {
	!SYSTEM_PREFIXES.iter().any(|p| function.starts_with(p))
}
