// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Capability Negotiator (spec §4.E): reconciles what a channel sent, what
//! the provider accepts, and what policy permits into a single
//! [`DeliveryPlan`]. Grounded on `sven-tools/src/policy.rs`'s shape of a
//! pure function turning declarative limits into a decision, generalized
//! from one dimension (glob patterns) to the three-way modality
//! intersection spec.md §4.E requires.

use std::collections::HashMap;

use mozi_config::{CapabilityProfile, Modality, ModalityLimits};

/// One input part a channel handed the runtime before it becomes a
/// [`mozi_model::ContentBlock`].
#[derive(Debug, Clone)]
pub struct InputPart {
    pub modality: Modality,
    pub bytes: u64,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct RuntimeLimits {
    pub max_total_bytes: u64,
    pub latency_budget_ms: Option<u64>,
}

/// Why a part's content changed shape on the way into the plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformStep {
    pub modality: Modality,
    pub reason: String,
}

/// One part after negotiation: either passed through unchanged, or
/// replaced by a text stand-in recording why.
#[derive(Debug, Clone)]
pub struct MappedPart {
    pub modality: Modality,
    pub bytes: u64,
    pub text_stand_in: Option<String>,
    pub transform: Option<TransformStep>,
}

#[derive(Debug, Clone)]
pub struct DeliveryPlan {
    pub input_parts: Vec<MappedPart>,
    pub output_modalities: Vec<Modality>,
    pub output_transform: Option<TransformStep>,
}

fn merge_limits(profiles: &[&ModalityLimits]) -> ModalityLimits {
    let mut enabled = true;
    let mut max_bytes: Option<u64> = None;
    let mut max_duration_ms: Option<u64> = None;
    let mut accepted_mime_types: Option<Vec<String>> = None;
    let mut first_mime = true;

    for limits in profiles {
        enabled &= limits.enabled;
        max_bytes = match (max_bytes, limits.max_bytes) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, None) => a,
            (None, b) => b,
        };
        max_duration_ms = match (max_duration_ms, limits.max_duration_ms) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, None) => a,
            (None, b) => b,
        };
        if let Some(mimes) = &limits.accepted_mime_types {
            accepted_mime_types = Some(match accepted_mime_types.take() {
                Some(existing) if !first_mime => {
                    existing.into_iter().filter(|m| mimes.contains(m)).collect()
                }
                _ => mimes.clone(),
            });
            first_mime = false;
        }
    }

    ModalityLimits {
        enabled,
        max_bytes,
        max_duration_ms,
        accepted_mime_types,
    }
}

/// Effective per-modality limits: component-wise intersection of channel ∩
/// provider ∩ policy.
fn effective_limits(
    modality: Modality,
    channel: &CapabilityProfile,
    provider: &CapabilityProfile,
    policy: &CapabilityProfile,
    by: fn(&CapabilityProfile) -> &HashMap<Modality, ModalityLimits>,
) -> ModalityLimits {
    let empty = ModalityLimits::default();
    let c = by(channel).get(&modality).unwrap_or(&empty);
    let p = by(provider).get(&modality).unwrap_or(&empty);
    let q = by(policy).get(&modality).unwrap_or(&empty);
    merge_limits(&[c, p, q])
}

fn passes(limits: &ModalityLimits, part_bytes: u64, mime: Option<&str>) -> bool {
    if !limits.enabled {
        return false;
    }
    if let Some(max) = limits.max_bytes {
        if part_bytes > max {
            return false;
        }
    }
    if let (Some(accepted), Some(mime)) = (&limits.accepted_mime_types, mime) {
        if !accepted.iter().any(|m| m == mime) {
            return false;
        }
    }
    true
}

fn text_stand_in_for(modality: Modality) -> String {
    let name = match modality {
        Modality::Text => "text",
        Modality::Image => "image",
        Modality::Audio => "audio",
        Modality::Video => "video",
        Modality::File => "file",
    };
    format!("[{name} omitted: no compatible {name} pipeline available]")
}

/// Negotiate a [`DeliveryPlan`] for one turn's input parts and requested
/// output modalities. Returns `Err(reason)` when the plan cannot be made to
/// fit even after fallback.
pub fn negotiate(
    parts: &[InputPart],
    requested_output: &[Modality],
    channel: &CapabilityProfile,
    provider: &CapabilityProfile,
    policy: &CapabilityProfile,
    limits: RuntimeLimits,
) -> Result<DeliveryPlan, String> {
    let mut mapped = Vec::with_capacity(parts.len());
    let mut total_bytes: u64 = 0;

    for part in parts {
        let input_limits = effective_limits(part.modality, channel, provider, policy, |p| &p.input);
        if passes(&input_limits, part.bytes, part.mime_type.as_deref()) {
            total_bytes += part.bytes;
            mapped.push(MappedPart {
                modality: part.modality,
                bytes: part.bytes,
                text_stand_in: None,
                transform: None,
            });
            continue;
        }

        let text_limits = effective_limits(Modality::Text, channel, provider, policy, |p| &p.input);
        let stand_in = text_stand_in_for(part.modality);
        let stand_in_bytes = stand_in.len() as u64;
        if !passes(&text_limits, stand_in_bytes, Some("text/plain")) {
            return Err(format!(
                "{:?} part rejected by limits and its text fallback also fails limits",
                part.modality
            ));
        }
        total_bytes += stand_in_bytes;
        mapped.push(MappedPart {
            modality: part.modality,
            bytes: stand_in_bytes,
            text_stand_in: Some(stand_in.clone()),
            transform: Some(TransformStep {
                modality: part.modality,
                reason: stand_in,
            }),
        });
    }

    if total_bytes > limits.max_total_bytes {
        return Err(format!(
            "provider-bound payload of {total_bytes} bytes exceeds maxTotalBytes {}",
            limits.max_total_bytes
        ));
    }

    let mut output_modalities: Vec<Modality> = requested_output
        .iter()
        .copied()
        .filter(|m| {
            effective_limits(*m, channel, provider, policy, |p| &p.output).enabled
        })
        .collect();

    let output_transform = if output_modalities.is_empty() {
        let text_output = effective_limits(Modality::Text, channel, provider, policy, |p| &p.output);
        if text_output.enabled {
            output_modalities.push(Modality::Text);
            Some(TransformStep {
                modality: Modality::Text,
                reason: "no requested output modality is accepted; summarizing to text".to_string(),
            })
        } else {
            return Err("no requested output modality is accepted and text output is disabled".to_string());
        }
    } else {
        None
    };

    Ok(DeliveryPlan {
        input_parts: mapped,
        output_modalities,
        output_transform,
    })
}
