//! Runtime-mutable tracker configuration and prompt/tool-schema builders.
//!
//! The tracker defines WHAT the LLM listens for. Readers always see a
//! consistent snapshot: the live config is an `Arc` swapped atomically under
//! a short write lock, so an in-flight analysis keeps the config it started
//! with while `PUT /config` installs the next one.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerCategory {
    pub key: String,
    pub label: String,
    pub description: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerConfig {
    pub name: String,
    pub description: String,
    pub categories: Vec<TrackerCategory>,
    pub extra_instructions: String,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        let category = |key: &str, label: &str, description: &str| TrackerCategory {
            key: key.into(),
            label: label.into(),
            description: description.into(),
            enabled: true,
        };
        Self {
            name: "Meeting Intelligence".into(),
            description: "Detects decisions, action items, key insights, and commitments.".into(),
            categories: vec![
                category(
                    "decision",
                    "Decision",
                    "Something the group has clearly agreed to or resolved (\"we will\", \
                     \"we've decided\", \"let's go with\", \"we agreed\")",
                ),
                category(
                    "action_item",
                    "Action Item",
                    "A concrete task assigned to someone with clear ownership (\"John will\", \
                     \"we need to\", \"I'll take care of\", \"Alice is going to\")",
                ),
                category(
                    "key_insight",
                    "Key Insight",
                    "An important observation, status update, risk flag, or strategic insight \
                     shared during the meeting that others should know about",
                ),
                category(
                    "commitment",
                    "Commitment",
                    "A timeline, deadline, or resource commitment (\"by end of quarter\", \
                     \"we'll ship by Friday\", \"budget approved for X\")",
                ),
            ],
            extra_instructions: "Be conservative. Tentative language (\"maybe\", \"what if\", \
                \"could we\") is NOT a decision. If multiple things are present, pick the most \
                significant one. Keep summaries short and specific (one sentence). Include the \
                names of people mentioned whenever possible."
                .into(),
        }
    }
}

impl TrackerConfig {
    pub fn enabled_categories(&self) -> impl Iterator<Item = &TrackerCategory> {
        self.categories.iter().filter(|c| c.enabled)
    }

    /// System prompt enumerating the enabled categories plus the rules.
    pub fn build_system_prompt(&self) -> String {
        let mut lines = vec![
            "You are a precise meeting analyst.".to_string(),
            "You are given a rolling window of recent transcript segments from a live meeting."
                .to_string(),
            String::new(),
            "Your job: detect exactly ONE of the following, if present:".to_string(),
        ];
        for cat in self.enabled_categories() {
            lines.push(format!("- **{}**: {}", cat.key, cat.description));
        }
        lines.push("- **no_match**: nothing significant to capture right now".to_string());
        lines.push(String::new());
        lines.push("Rules:".to_string());
        for rule in self.extra_instructions.split(". ") {
            let rule = rule.trim().trim_end_matches('.');
            if !rule.is_empty() {
                lines.push(format!("- {rule}."));
            }
        }
        lines.push("- Always call capture_meeting_item, even for no_match.".to_string());
        lines.push(
            "- Extract entities (people, companies, products, dates, amounts, documents, \
             topics) relevant to the detected item."
                .to_string(),
        );
        lines.push("- For no_match, entities should be an empty array.".to_string());
        lines.join("\n")
    }

    /// Tool schema with `type` restricted to enabled keys plus `no_match`.
    pub fn build_tool_schema(&self) -> Value {
        let enabled_keys: Vec<&str> = self.enabled_categories().map(|c| c.key.as_str()).collect();
        let mut type_enum: Vec<&str> = enabled_keys.clone();
        type_enum.push("no_match");

        let type_desc = self
            .enabled_categories()
            .map(|c| format!("\"{}\": {}", c.key, c.description))
            .chain(std::iter::once("\"no_match\": nothing found".to_string()))
            .collect::<Vec<_>>()
            .join("; ");

        json!({
            "type": "function",
            "function": {
                "name": "capture_meeting_item",
                "description": format!(
                    "Call this when you detect a tracked item in the transcript. Categories: {}. \
                     Call with type='no_match' if nothing significant is present.",
                    enabled_keys.join(", ")
                ),
                "parameters": {
                    "type": "object",
                    "properties": {
                        "type": {
                            "type": "string",
                            "enum": type_enum,
                            "description": type_desc,
                        },
                        "summary": {
                            "type": "string",
                            "description": "One-sentence summary of the item. Empty string for no_match.",
                        },
                        "speaker": {
                            "type": ["string", "null"],
                            "description": "Speaker name if clearly attributable, otherwise null.",
                        },
                        "confidence": {
                            "type": "number",
                            "description": "Confidence score between 0 and 1.",
                        },
                        "entities": {
                            "type": "array",
                            "description": "Entities mentioned in this item. Extract people, companies, \
                                 products, dates/deadlines, dollar amounts, documents, and topics. \
                                 Only include entities directly relevant to this specific item.",
                            "items": {
                                "type": "object",
                                "properties": {
                                    "type": {
                                        "type": "string",
                                        "enum": ["person", "company", "product", "date", "amount", "document", "topic"],
                                        "description": "Entity type.",
                                    },
                                    "label": {
                                        "type": "string",
                                        "description": "Display text for the entity (e.g. 'Sarah Chen', 'AWS', 'March 15').",
                                    },
                                    "id": {
                                        "type": "string",
                                        "description": "Unique slug ID, lowercase with hyphens (e.g. 'sarah-chen', 'aws', 'mar-15').",
                                    },
                                },
                                "required": ["type", "label", "id"],
                            },
                        },
                    },
                    "required": ["type", "summary", "speaker", "confidence"],
                },
            },
        })
    }
}

/// Process-wide tracker store with atomic snapshot swap.
#[derive(Default)]
pub struct TrackerStore {
    inner: RwLock<Arc<TrackerConfig>>,
}

impl TrackerStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Arc::new(TrackerConfig::default())),
        }
    }

    /// Current snapshot; cheap, never blocks writers for long.
    pub fn get(&self) -> Arc<TrackerConfig> {
        Arc::clone(&self.inner.read())
    }

    /// Atomic replace. Takes effect on the next LLM call.
    pub fn set(&self, config: TrackerConfig) -> Arc<TrackerConfig> {
        let config = Arc::new(config);
        *self.inner.write() = Arc::clone(&config);
        config
    }

    pub fn reset(&self) -> Arc<TrackerConfig> {
        self.set(TrackerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_reset_round_trips_to_defaults() {
        let store = TrackerStore::new();
        let mut custom = TrackerConfig::default();
        custom.name = "Sales Tracker".into();
        custom.categories.retain(|c| c.key == "decision");
        store.set(custom);
        assert_eq!(store.get().name, "Sales Tracker");

        store.reset();
        assert_eq!(*store.get(), TrackerConfig::default());
    }

    #[test]
    fn prompt_lists_only_enabled_categories() {
        let mut config = TrackerConfig::default();
        config
            .categories
            .iter_mut()
            .find(|c| c.key == "commitment")
            .unwrap()
            .enabled = false;
        let prompt = config.build_system_prompt();
        assert!(prompt.contains("**decision**"));
        assert!(prompt.contains("**no_match**"));
        assert!(!prompt.contains("**commitment**"));
    }

    #[test]
    fn tool_schema_enum_is_enabled_keys_plus_no_match() {
        let config = TrackerConfig::default();
        let schema = config.build_tool_schema();
        let type_enum = schema["function"]["parameters"]["properties"]["type"]["enum"]
            .as_array()
            .unwrap();
        let keys: Vec<&str> = type_enum.iter().map(|v| v.as_str().unwrap()).collect();
        assert_eq!(
            keys,
            ["decision", "action_item", "key_insight", "commitment", "no_match"]
        );
    }

    #[test]
    fn snapshot_survives_a_concurrent_swap() {
        let store = TrackerStore::new();
        let snapshot = store.get();
        store.set(TrackerConfig {
            name: "Replaced".into(),
            ..TrackerConfig::default()
        });
        // The old snapshot is still fully intact for its holder.
        assert_eq!(snapshot.name, "Meeting Intelligence");
        assert_eq!(store.get().name, "Replaced");
    }
}
