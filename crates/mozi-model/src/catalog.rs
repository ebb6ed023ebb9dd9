// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Static model catalog (grounded on `sven-model/src/catalog.rs`).
//!
//! Expanded from the teacher's `{Text, Image}` modality set to spec.md §3's
//! full `{text, image, audio, video, file}`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputModality {
    Text,
    Image,
    Audio,
    Video,
    File,
}

fn default_input_modalities() -> Vec<InputModality> {
    vec![InputModality::Text]
}

/// One entry in the static model catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCatalogEntry {
    pub id: String,
    pub name: String,
    pub provider: String,
    pub context_window: u32,
    pub max_output_tokens: u32,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_input_modalities")]
    pub input_modalities: Vec<InputModality>,
}

impl ModelCatalogEntry {
    pub fn supports_images(&self) -> bool {
        self.input_modalities.contains(&InputModality::Image)
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    models: Vec<ModelCatalogEntry>,
}

fn raw_catalog() -> &'static str {
    include_str!("../models.yaml")
}

/// Parse the bundled `models.yaml` catalog. Panics on malformed bundled
/// data — this is checked-in static data, a parse failure means the file is
/// broken, not a runtime condition to recover from.
pub fn static_catalog() -> Vec<ModelCatalogEntry> {
    let file: CatalogFile =
        serde_yaml::from_str(raw_catalog()).expect("bundled models.yaml must parse");
    file.models
}

pub fn lookup<'a>(catalog: &'a [ModelCatalogEntry], provider: &str, model_id: &str) -> Option<&'a ModelCatalogEntry> {
    catalog
        .iter()
        .find(|m| m.provider.eq_ignore_ascii_case(provider) && m.id == model_id)
}

pub fn lookup_by_model_name<'a>(catalog: &'a [ModelCatalogEntry], model_name: &str) -> Option<&'a ModelCatalogEntry> {
    catalog.iter().find(|m| m.name == model_name)
}

pub fn context_window(catalog: &[ModelCatalogEntry], provider: &str, model_id: &str, default: u32) -> u32 {
    lookup(catalog, provider, model_id)
        .map(|m| m.context_window)
        .unwrap_or(default)
}

pub fn max_output_tokens(catalog: &[ModelCatalogEntry], provider: &str, model_id: &str, default: u32) -> u32 {
    lookup(catalog, provider, model_id)
        .map(|m| m.max_output_tokens)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundled_catalog_is_non_empty() {
        assert!(!static_catalog().is_empty());
    }

    #[test]
    fn all_entries_have_text_modality() {
        for entry in static_catalog() {
            assert!(entry.input_modalities.contains(&InputModality::Text));
        }
    }

    #[test]
    fn unknown_lookup_returns_none() {
        let catalog = static_catalog();
        assert!(lookup(&catalog, "nonexistent-provider", "nonexistent-model").is_none());
    }

    #[test]
    fn missing_entry_falls_back_to_default() {
        let catalog = static_catalog();
        assert_eq!(context_window(&catalog, "nope", "nope", 8192), 8192);
    }
}
