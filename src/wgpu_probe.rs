// ABOUTME: Native GPU platform backed by wgpu adapter enumeration
// ABOUTME: Maps wgpu adapters, feature sets, and devices onto the capability traits
//
// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 dravr.ai

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::capability::{AdapterInfo, DeviceHandle, GpuAdapter, GpuFeatures, GpuPlatform};
use crate::types::KilnError;

/// Device label used for the probe device
const DEVICE_LABEL: &str = "kiln-probe";

/// GPU platform using the native wgpu instance
pub struct WgpuPlatform {
    instance: wgpu::Instance,
}

impl WgpuPlatform {
    /// Create a platform over all native backends
    #[must_use]
    pub fn new() -> Self {
        Self {
            instance: wgpu::Instance::new(&wgpu::InstanceDescriptor::default()),
        }
    }
}

impl Default for WgpuPlatform {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GpuPlatform for WgpuPlatform {
    fn is_available(&self) -> bool {
        true
    }

    async fn request_adapter(&self) -> Result<Option<Arc<dyn GpuAdapter>>, KilnError> {
        let adapter = self
            .instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                ..Default::default()
            })
            .await;
        Ok(adapter.map(|adapter| Arc::new(WgpuAdapter { adapter }) as Arc<dyn GpuAdapter>))
    }
}

struct WgpuAdapter {
    adapter: wgpu::Adapter,
}

#[async_trait]
impl GpuAdapter for WgpuAdapter {
    fn info(&self) -> AdapterInfo {
        let info = self.adapter.get_info();
        AdapterInfo {
            name: info.name,
            backend: format!("{:?}", info.backend).to_lowercase(),
        }
    }

    fn features(&self) -> Result<GpuFeatures, KilnError> {
        let native = self.adapter.features();
        let mut features = GpuFeatures::empty();
        if native.contains(wgpu::Features::SHADER_F16) {
            features |= GpuFeatures::SHADER_F16;
        }
        if native.contains(wgpu::Features::TIMESTAMP_QUERY) {
            features |= GpuFeatures::TIMESTAMP_QUERY;
        }
        if native.contains(wgpu::Features::SUBGROUP) {
            features |= GpuFeatures::SUBGROUPS;
        }
        debug!(?features, "Mapped wgpu adapter features");
        Ok(features)
    }

    async fn request_device(&self) -> Result<DeviceHandle, KilnError> {
        let descriptor = wgpu::DeviceDescriptor {
            label: Some(DEVICE_LABEL),
            ..Default::default()
        };
        let (device, queue) = self
            .adapter
            .request_device(&descriptor, None)
            .await
            .map_err(|e| KilnError::unsupported_platform(format!("device request failed: {e}")))?;
        Ok(DeviceHandle::new(
            DEVICE_LABEL,
            Some(Arc::new((device, queue))),
        ))
    }
}
