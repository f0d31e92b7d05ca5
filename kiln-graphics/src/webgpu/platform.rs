//! Platform-specific initialization.
//!
//! WASM initializes asynchronously, native blocks on the same future with
//! pollster.

use super::*;

use crate::ContextDesc;

//=============================================================================
// Platform Error
//=============================================================================

#[derive(Debug)]
pub struct PlatformError(pub String);

impl std::fmt::Display for PlatformError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for PlatformError {}

//=============================================================================
// Initialization
//=============================================================================

/// Features used when the adapter has them.
fn optional_features() -> wgpu::Features {
    wgpu::Features::TIMESTAMP_QUERY
        | wgpu::Features::TIMESTAMP_QUERY_INSIDE_ENCODERS
        | wgpu::Features::POLYGON_MODE_LINE
        | wgpu::Features::ADDRESS_MODE_CLAMP_TO_BORDER
}

async fn request_context(desc: &ContextDesc) -> Result<Context, PlatformError> {
    let backends = if cfg!(target_arch = "wasm32") {
        wgpu::Backends::BROWSER_WEBGPU
    } else {
        wgpu::Backends::PRIMARY
    };
    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends,
        ..Default::default()
    });

    // wgpu v28: request_adapter returns Result<Adapter, RequestAdapterError>
    let adapter = instance
        .request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        })
        .await
        .map_err(|e| PlatformError(format!("Adapter request failed: {}", e)))?;

    let features = adapter.features() & optional_features();
    let (device, queue) = adapter
        .request_device(&wgpu::DeviceDescriptor {
            label: Some("kiln device"),
            required_features: features,
            required_limits: wgpu::Limits::default().using_resolution(adapter.limits()),
            memory_hints: wgpu::MemoryHints::default(),
            experimental_features: wgpu::ExperimentalFeatures::default(),
            trace: wgpu::Trace::Off,
        })
        .await
        .map_err(|e| PlatformError(format!("Device request failed: {}", e)))?;

    let lost = Arc::new(AtomicBool::new(false));
    let lost_flag = Arc::clone(&lost);
    device.set_device_lost_callback(move |reason, message| {
        log::error!("WebGPU device lost: {:?} - {}", reason, message);
        lost_flag.store(true, Ordering::Release);
    });

    let info = adapter.get_info();
    log::info!("Adapter {:?} on {:?}", info.name, info.backend);
    let wgpu_limits = device.limits();
    let limits = DeviceLimits {
        min_uniform_buffer_offset_alignment: wgpu_limits.min_uniform_buffer_offset_alignment,
        max_texture_dimension_2d: wgpu_limits.max_texture_dimension_2d,
        timestamp_queries: features.contains(
            wgpu::Features::TIMESTAMP_QUERY | wgpu::Features::TIMESTAMP_QUERY_INSIDE_ENCODERS,
        ),
        timestamp_period: queue.get_timestamp_period(),
        polygon_mode_line: features.contains(wgpu::Features::POLYGON_MODE_LINE),
        clamp_to_border: features.contains(wgpu::Features::ADDRESS_MODE_CLAMP_TO_BORDER),
    };
    log::debug!("Device limits: {:?}", limits);

    Ok(Context {
        instance,
        adapter,
        device,
        queue,
        hub: RwLock::new(Hub::new()),
        limits,
        validation: desc.validation,
        lost,
    })
}

#[cfg(target_arch = "wasm32")]
pub async fn create_context_async(desc: &ContextDesc) -> Result<Context, PlatformError> {
    request_context(desc).await
}

#[cfg(not(target_arch = "wasm32"))]
pub fn create_context(desc: &ContextDesc) -> Result<Context, PlatformError> {
    pollster::block_on(request_context(desc))
}
