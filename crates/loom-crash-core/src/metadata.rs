// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Free-form metadata grouped into named sections ("tabs").

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Mapping of section name to key/value pairs.
///
/// Setting a key to `Value::Null` removes it, and a section left empty is
/// dropped, so a serialized metadata object never carries empty tabs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata {
	sections: BTreeMap<String, Map<String, Value>>,
}

impl Metadata {
	pub fn new() -> Self {
		Self::default()
	}

	/// Adds a single value to a section.
	pub fn add(&mut self, section: &str, key: &str, value: impl Into<Value>) {
		let value = value.into();
		if value.is_null() {
			self.clear(section, key);
			return;
		}
		self
			.sections
			.entry(section.to_string())
			.or_default()
			.insert(key.to_string(), value);
	}

	/// Merges a map of values into a section.
	pub fn add_section(&mut self, section: &str, values: Map<String, Value>) {
		for (key, value) in values {
			self.add(section, &key, value);
		}
	}

	pub fn get(&self, section: &str, key: &str) -> Option<&Value> {
		self.sections.get(section).and_then(|s| s.get(key))
	}

	pub fn get_section(&self, section: &str) -> Option<&Map<String, Value>> {
		self.sections.get(section)
	}

	/// Removes a single key from a section.
	pub fn clear(&mut self, section: &str, key: &str) {
		if let Some(values) = self.sections.get_mut(section) {
			values.remove(key);
			if values.is_empty() {
				self.sections.remove(section);
			}
		}
	}

	pub fn clear_section(&mut self, section: &str) {
		self.sections.remove(section);
	}

	/// Merges `other` into this metadata. Values from `other` win.
	pub fn merge(&mut self, other: &Metadata) {
		for (section, values) in &other.sections {
			self.add_section(section, values.clone());
		}
	}

	pub fn is_empty(&self) -> bool {
		self.sections.is_empty()
	}

	pub fn sections(&self) -> impl Iterator<Item = &str> {
		self.sections.keys().map(String::as_str)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn add_and_get() {
		let mut md = Metadata::new();
		md.add("account", "plan", "pro");
		assert_eq!(md.get("account", "plan"), Some(&json!("pro")));
		assert!(md.get("account", "missing").is_none());
	}

	#[test]
	fn null_value_clears_key_and_empty_section() {
		let mut md = Metadata::new();
		md.add("account", "plan", "pro");
		md.add("account", "plan", Value::Null);
		assert!(md.get_section("account").is_none());
		assert!(md.is_empty());
	}

	#[test]
	fn merge_prefers_other() {
		let mut base = Metadata::new();
		base.add("app", "theme", "dark");
		base.add("app", "lang", "en");

		let mut other = Metadata::new();
		other.add("app", "theme", "light");

		base.merge(&other);
		assert_eq!(base.get("app", "theme"), Some(&json!("light")));
		assert_eq!(base.get("app", "lang"), Some(&json!("en")));
	}

	#[test]
	fn serializes_as_plain_object() {
		let mut md = Metadata::new();
		md.add("device", "rooted", false);
		assert_eq!(serde_json::to_value(&md).unwrap(), json!({"device": {"rooted": false}}));
	}
}
