// ABOUTME: GPU capability probing: the hard precondition gate before any other pipeline stage
// ABOUTME: Defines platform/adapter traits, feature flags, and a config-declared platform
//
// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 dravr.ai

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::types::KilnError;

/// Feature name of the reduced-precision compute extension
pub const SHADER_F16: &str = "shader-f16";

/// Adapter name declared when the GPU belongs to the inference server
pub const DEFAULT_DECLARED_ADAPTER: &str = "inference-server";

bitflags::bitflags! {
    /// Adapter feature flags relevant to model selection
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct GpuFeatures: u8 {
        /// Half-precision arithmetic in compute shaders
        const SHADER_F16 = 0b0000_0001;
        /// Timestamp queries for profiling
        const TIMESTAMP_QUERY = 0b0000_0010;
        /// Subgroup operations in compute shaders
        const SUBGROUPS = 0b0000_0100;
    }
}

impl GpuFeatures {
    /// Map a feature name (`shader-f16`, `timestamp-query`, `subgroups`) to its flag
    #[must_use]
    pub fn from_feature_name(name: &str) -> Option<Self> {
        match name.trim() {
            SHADER_F16 => Some(Self::SHADER_F16),
            "timestamp-query" => Some(Self::TIMESTAMP_QUERY),
            "subgroups" => Some(Self::SUBGROUPS),
            _ => None,
        }
    }

    /// Check for a feature by name; unknown names are never present
    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        Self::from_feature_name(name).is_some_and(|flag| self.contains(flag))
    }
}

/// Descriptive information about an adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterInfo {
    /// Adapter name as reported by the driver
    pub name: String,
    /// Backend identifier (vulkan, metal, dx12, declared)
    pub backend: String,
}

/// Logical device handle returned by a successful probe
///
/// The handle keeps any backend resources alive for as long as it is held.
pub struct DeviceHandle {
    label: String,
    _resources: Option<Arc<dyn Any + Send + Sync>>,
}

impl DeviceHandle {
    /// Create a device handle that owns backend resources
    pub fn new(label: impl Into<String>, resources: Option<Arc<dyn Any + Send + Sync>>) -> Self {
        Self {
            label: label.into(),
            _resources: resources,
        }
    }

    /// Device label
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

/// Host environment exposing (or not) a GPU interface
#[async_trait]
pub trait GpuPlatform: Send + Sync {
    /// Whether the acceleration interface exists at all
    fn is_available(&self) -> bool;

    /// Request an adapter; `None` when the platform has no usable one
    async fn request_adapter(&self) -> Result<Option<Arc<dyn GpuAdapter>>, KilnError>;
}

/// A physical adapter able to hand out logical devices
#[async_trait]
pub trait GpuAdapter: Send + Sync {
    /// Adapter description
    fn info(&self) -> AdapterInfo;

    /// Query the adapter feature set; may fail on some drivers
    fn features(&self) -> Result<GpuFeatures, KilnError>;

    /// Request a logical device (may allocate GPU resources)
    async fn request_device(&self) -> Result<DeviceHandle, KilnError>;
}

/// Outcome of a successful capability probe
pub struct CapabilityReport {
    /// Adapter the device was created from
    pub adapter: Arc<dyn GpuAdapter>,
    /// Adapter description captured at probe time
    pub adapter_info: AdapterInfo,
    /// Logical device, held for the lifetime of the report
    pub device: DeviceHandle,
}

impl fmt::Debug for CapabilityReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityReport")
            .field("adapter_info", &self.adapter_info)
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

/// Probe the platform for a usable adapter and device
///
/// This is a one-shot gate: failures are reported, never retried.
///
/// # Errors
///
/// Returns `UnsupportedPlatform("interface missing")` when the interface is
/// absent and `UnsupportedPlatform("no adapter")` when no adapter is offered.
/// Device creation failures are reported with the same kind.
pub async fn probe(platform: &dyn GpuPlatform) -> Result<CapabilityReport, KilnError> {
    if !platform.is_available() {
        return Err(KilnError::unsupported_platform("interface missing"));
    }

    let Some(adapter) = platform.request_adapter().await? else {
        return Err(KilnError::unsupported_platform("no adapter"));
    };

    let adapter_info = adapter.info();
    debug!(adapter = %adapter_info.name, backend = %adapter_info.backend, "Adapter acquired");

    let device = adapter.request_device().await.map_err(|e| {
        KilnError::unsupported_platform(format!("device request failed: {}", e.message))
    })?;

    info!(
        adapter = %adapter_info.name,
        backend = %adapter_info.backend,
        device = device.label(),
        "GPU capability probe passed"
    );

    Ok(CapabilityReport {
        adapter,
        adapter_info,
        device,
    })
}

// ============================================================================
// Declared platform
// ============================================================================

/// GPU capabilities declared in configuration instead of probed
///
/// Used when the GPU belongs to the inference server process and this host
/// only needs to know what that server can do.
///
/// Fields missing from a config table take the [`Default`] values: an
/// available interface with the inference server's adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuConfig {
    /// Whether the acceleration interface is present
    pub interface: bool,
    /// Adapter name; `None` means the platform offers no adapter
    pub adapter: Option<String>,
    /// Feature names supported by the adapter
    pub features: Vec<String>,
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            interface: true,
            adapter: Some(DEFAULT_DECLARED_ADAPTER.to_owned()),
            features: Vec::new(),
        }
    }
}

/// Platform built from a [`GpuConfig`]
#[derive(Debug, Clone)]
pub struct DeclaredPlatform {
    config: GpuConfig,
}

impl DeclaredPlatform {
    /// Create a declared platform
    #[must_use]
    pub const fn new(config: GpuConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl GpuPlatform for DeclaredPlatform {
    fn is_available(&self) -> bool {
        self.config.interface
    }

    async fn request_adapter(&self) -> Result<Option<Arc<dyn GpuAdapter>>, KilnError> {
        let Some(name) = self.config.adapter.clone() else {
            return Ok(None);
        };
        let mut features = GpuFeatures::empty();
        for feature in &self.config.features {
            match GpuFeatures::from_feature_name(feature) {
                Some(flag) => features |= flag,
                None => debug!(feature = %feature, "Ignoring unknown declared GPU feature"),
            }
        }
        Ok(Some(Arc::new(DeclaredAdapter { name, features })))
    }
}

struct DeclaredAdapter {
    name: String,
    features: GpuFeatures,
}

#[async_trait]
impl GpuAdapter for DeclaredAdapter {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            name: self.name.clone(),
            backend: "declared".to_owned(),
        }
    }

    fn features(&self) -> Result<GpuFeatures, KilnError> {
        Ok(self.features)
    }

    async fn request_device(&self) -> Result<DeviceHandle, KilnError> {
        Ok(DeviceHandle::new(format!("{} (declared)", self.name), None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn declared(interface: bool, adapter: Option<&str>, features: &[&str]) -> DeclaredPlatform {
        DeclaredPlatform::new(GpuConfig {
            interface,
            adapter: adapter.map(ToOwned::to_owned),
            features: features.iter().map(|f| (*f).to_owned()).collect(),
        })
    }

    #[tokio::test]
    async fn missing_interface_fails_first() {
        let err = probe(&declared(false, Some("gpu0"), &[])).await.unwrap_err();
        assert_eq!(err.kind, crate::types::ErrorKind::UnsupportedPlatform);
        assert_eq!(err.message, "interface missing");
    }

    #[tokio::test]
    async fn missing_adapter_is_reported() {
        let err = probe(&declared(true, None, &[])).await.unwrap_err();
        assert_eq!(err.message, "no adapter");
    }

    #[tokio::test]
    async fn declared_adapter_passes_with_features() {
        let report = probe(&declared(true, Some("gpu0"), &["shader-f16", "warp-drive"]))
            .await
            .unwrap();
        assert_eq!(report.adapter_info.name, "gpu0");
        assert_eq!(report.device.label(), "gpu0 (declared)");
        let features = report.adapter.features().unwrap();
        assert!(features.has(SHADER_F16));
        assert!(!features.has("timestamp-query"));
    }

    #[test]
    fn unknown_feature_names_are_absent() {
        assert!(!GpuFeatures::all().has("warp-drive"));
        assert_eq!(
            GpuFeatures::from_feature_name(" subgroups "),
            Some(GpuFeatures::SUBGROUPS)
        );
    }

    #[test]
    fn feature_names_differ_from_flag_identifiers() {
        assert_eq!(
            GpuFeatures::from_feature_name("shader-f16"),
            Some(GpuFeatures::SHADER_F16)
        );
        assert_eq!(GpuFeatures::from_feature_name("SHADER_F16"), None);
        assert_eq!(
            GpuFeatures::from_name("SHADER_F16"),
            Some(GpuFeatures::SHADER_F16)
        );
    }
}
