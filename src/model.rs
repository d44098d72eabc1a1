// ABOUTME: Model catalog and the single selection policy (explicit id or feature-probed auto)
// ABOUTME: Picks the f16 model when the adapter supports shader-f16, otherwise the f32 fallback
//
// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 dravr.ai

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::capability::{GpuAdapter, SHADER_F16};

/// Default high-quality model, requires `shader-f16`
const HIGH_QUALITY_MODEL: &str = "Phi-3.5-mini-instruct-q4f16_1-MLC";

/// Default compatibility model, runs on any adapter
const COMPATIBILITY_MODEL: &str = "Phi-3.5-mini-instruct-q4f32_1-MLC";

/// Static description of a loadable model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Engine-specific model identifier
    pub id: String,
    /// Human-readable name
    pub display_name: String,
    /// Whether the model needs the reduced-precision compute extension
    pub requires_reduced_precision_ext: bool,
    /// Approximate VRAM footprint in megabytes
    pub approx_vram_mb: u32,
}

impl ModelDescriptor {
    /// Descriptor for an id that is not in the catalog
    #[must_use]
    pub fn custom(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            requires_reduced_precision_ext: false,
            approx_vram_mb: 0,
        }
    }
}

impl fmt::Display for ModelDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_name, self.id)
    }
}

/// How the model is chosen at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelMode {
    /// Probe the adapter for `shader-f16` and pick accordingly
    Auto,
    /// Use this descriptor as-is
    Explicit(ModelDescriptor),
}

impl ModelMode {
    /// Parse a configured model string: `auto` or a model id
    #[must_use]
    pub fn parse(value: &str, catalog: &ModelCatalog) -> Self {
        let value = value.trim();
        if value.is_empty() || value.eq_ignore_ascii_case("auto") {
            return Self::Auto;
        }
        Self::Explicit(
            catalog
                .find(value)
                .cloned()
                .unwrap_or_else(|| ModelDescriptor::custom(value)),
        )
    }
}

/// The static model set the selector chooses from
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    high_quality: ModelDescriptor,
    compatibility: ModelDescriptor,
}

impl ModelCatalog {
    /// Create a catalog from a high-quality and a compatibility model
    #[must_use]
    pub const fn new(high_quality: ModelDescriptor, compatibility: ModelDescriptor) -> Self {
        Self {
            high_quality,
            compatibility,
        }
    }

    /// Model used when `shader-f16` is available
    #[must_use]
    pub const fn high_quality(&self) -> &ModelDescriptor {
        &self.high_quality
    }

    /// Model used when it is not, or when probing fails
    #[must_use]
    pub const fn compatibility(&self) -> &ModelDescriptor {
        &self.compatibility
    }

    /// All catalog entries
    #[must_use]
    pub fn entries(&self) -> [&ModelDescriptor; 2] {
        [&self.high_quality, &self.compatibility]
    }

    /// Look up a descriptor by id
    #[must_use]
    pub fn find(&self, id: &str) -> Option<&ModelDescriptor> {
        self.entries().into_iter().find(|m| m.id == id)
    }
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self::new(
            ModelDescriptor {
                id: HIGH_QUALITY_MODEL.to_owned(),
                display_name: "Phi-3.5 Mini Instruct (f16)".to_owned(),
                requires_reduced_precision_ext: true,
                approx_vram_mb: 3672,
            },
            ModelDescriptor {
                id: COMPATIBILITY_MODEL.to_owned(),
                display_name: "Phi-3.5 Mini Instruct (f32)".to_owned(),
                requires_reduced_precision_ext: false,
                approx_vram_mb: 5483,
            },
        )
    }
}

/// Choose the model for this process
///
/// Explicit mode never touches the adapter. Auto mode picks the high-quality
/// model only when the adapter reports `shader-f16`; a missing adapter or a
/// failing feature query falls back to the compatibility model. Never fails.
pub fn select(
    mode: &ModelMode,
    catalog: &ModelCatalog,
    adapter: Option<&dyn GpuAdapter>,
) -> ModelDescriptor {
    let chosen = match mode {
        ModelMode::Explicit(descriptor) => descriptor.clone(),
        ModelMode::Auto => {
            let has_f16 = match adapter.map(|a| a.features()) {
                Some(Ok(features)) => features.has(SHADER_F16),
                Some(Err(e)) => {
                    warn!(error = %e, "Feature probe failed, using compatibility model");
                    false
                }
                None => false,
            };
            if has_f16 {
                catalog.high_quality().clone()
            } else {
                catalog.compatibility().clone()
            }
        }
    };
    info!(model = %chosen, auto = matches!(mode, ModelMode::Auto), "Model selected");
    chosen
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::capability::{AdapterInfo, DeviceHandle, GpuFeatures};
    use crate::types::KilnError;

    struct FixedAdapter(Result<GpuFeatures, KilnError>);

    #[async_trait]
    impl GpuAdapter for FixedAdapter {
        fn info(&self) -> AdapterInfo {
            AdapterInfo {
                name: "fixed".to_owned(),
                backend: "test".to_owned(),
            }
        }

        fn features(&self) -> Result<GpuFeatures, KilnError> {
            self.0.clone()
        }

        async fn request_device(&self) -> Result<DeviceHandle, KilnError> {
            Ok(DeviceHandle::new("fixed", None))
        }
    }

    #[test]
    fn auto_with_f16_picks_high_quality() {
        let catalog = ModelCatalog::default();
        let adapter = FixedAdapter(Ok(GpuFeatures::SHADER_F16));
        let chosen = select(&ModelMode::Auto, &catalog, Some(&adapter));
        assert_eq!(chosen.id, HIGH_QUALITY_MODEL);
        assert!(chosen.requires_reduced_precision_ext);
    }

    #[test]
    fn auto_without_f16_picks_compatibility() {
        let catalog = ModelCatalog::default();
        let adapter = FixedAdapter(Ok(GpuFeatures::TIMESTAMP_QUERY));
        let chosen = select(&ModelMode::Auto, &catalog, Some(&adapter));
        assert_eq!(chosen.id, COMPATIBILITY_MODEL);
    }

    #[test]
    fn auto_with_failing_probe_falls_back() {
        let catalog = ModelCatalog::default();
        let adapter = FixedAdapter(Err(KilnError::internal("features unavailable")));
        let chosen = select(&ModelMode::Auto, &catalog, Some(&adapter));
        assert_eq!(chosen.id, COMPATIBILITY_MODEL);
    }

    #[test]
    fn explicit_mode_ignores_adapter() {
        let catalog = ModelCatalog::default();
        let adapter = FixedAdapter(Ok(GpuFeatures::SHADER_F16));
        let mode = ModelMode::parse(COMPATIBILITY_MODEL, &catalog);
        let chosen = select(&mode, &catalog, Some(&adapter));
        assert_eq!(chosen.id, COMPATIBILITY_MODEL);
    }

    #[test]
    fn parse_unknown_id_builds_custom_descriptor() {
        let catalog = ModelCatalog::default();
        assert_eq!(ModelMode::parse(" AUTO ", &catalog), ModelMode::Auto);
        match ModelMode::parse("llama-3.2-1b", &catalog) {
            ModelMode::Explicit(d) => {
                assert_eq!(d.id, "llama-3.2-1b");
                assert!(!d.requires_reduced_precision_ext);
            }
            ModelMode::Auto => panic!("expected explicit mode"),
        }
    }
}
