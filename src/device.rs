//! Device Context: adapter/device acquisition, capability negotiation, and
//! the device-epoch discipline that every other component in this crate
//! relies on.
//!
//! The context is modelled as a value (`DeviceContext`) so a caller can build
//! one explicitly (tests, multiple partitions), plus a thread-local default
//! instance for the common "one device per worker" case described in the
//! design notes. wgpu's WASM objects are `!Send`, and this crate's owning
//! thread model is single-threaded cooperative (see the concurrency
//! section), so interior mutability is `RefCell`, not `Mutex`/`RwLock`.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::error::{CoreError, Result};

/// Exact feature name strings recognized by `has_feature`.
pub const FEATURE_SHADER_F16: &str = "shader-f16";
pub const FEATURE_SUBGROUPS: &str = "subgroups";
pub const FEATURE_SUBGROUPS_F16: &str = "subgroups-f16";
pub const FEATURE_TIMESTAMP_QUERY: &str = "timestamp-query";

/// The preferred optional features negotiated at `init` time.
fn preferred_features() -> wgpu::Features {
    wgpu::Features::SHADER_F16 | wgpu::Features::SUBGROUP | wgpu::Features::TIMESTAMP_QUERY
}

/// Snapshot of which optional features the active device actually granted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeatureSet {
    pub shader_f16: bool,
    pub subgroups: bool,
    /// wgpu does not expose a distinct "subgroup f16" feature flag; we treat
    /// it as shader_f16 && subgroups, which is the practical precondition for
    /// subgroup operations over half-precision values. Documented in DESIGN.md.
    pub subgroups_f16: bool,
    pub timestamp_query: bool,
}

impl FeatureSet {
    fn from_wgpu(features: wgpu::Features) -> Self {
        let shader_f16 = features.contains(wgpu::Features::SHADER_F16);
        let subgroups = features.contains(wgpu::Features::SUBGROUP);
        Self {
            shader_f16,
            subgroups,
            subgroups_f16: shader_f16 && subgroups,
            timestamp_query: features.contains(wgpu::Features::TIMESTAMP_QUERY),
        }
    }

    pub fn has(&self, name: &str) -> bool {
        match name {
            FEATURE_SHADER_F16 => self.shader_f16,
            FEATURE_SUBGROUPS => self.subgroups,
            FEATURE_SUBGROUPS_F16 => self.subgroups_f16,
            FEATURE_TIMESTAMP_QUERY => self.timestamp_query,
            _ => false,
        }
    }
}

/// Numeric limits resolved at device-request time, requested as the
/// adapter's maxima rather than wgpu's conservative defaults.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceLimits {
    pub max_buffer_size: u64,
    pub max_storage_buffer_binding_size: u64,
    pub max_uniform_buffer_binding_size: u32,
    pub max_compute_workgroup_size_x: u32,
    pub max_compute_workgroup_size_y: u32,
    pub max_compute_workgroup_size_z: u32,
    pub max_compute_invocations_per_workgroup: u32,
    pub max_compute_workgroup_storage_size: u32,
    pub max_compute_workgroups_per_dimension: u32,
}

impl DeviceLimits {
    fn from_wgpu(limits: &wgpu::Limits) -> Self {
        Self {
            max_buffer_size: limits.max_buffer_size,
            max_storage_buffer_binding_size: limits.max_storage_buffer_binding_size as u64,
            max_uniform_buffer_binding_size: limits.max_uniform_buffer_binding_size,
            max_compute_workgroup_size_x: limits.max_compute_workgroup_size_x,
            max_compute_workgroup_size_y: limits.max_compute_workgroup_size_y,
            max_compute_workgroup_size_z: limits.max_compute_workgroup_size_z,
            max_compute_invocations_per_workgroup: limits.max_compute_invocations_per_workgroup,
            max_compute_workgroup_storage_size: limits.max_compute_workgroup_storage_size,
            max_compute_workgroups_per_dimension: limits.max_compute_workgroups_per_dimension,
        }
    }
}

/// Adapter identification, mapped from `wgpu::AdapterInfo` onto the field
/// names this spec uses. wgpu has no separate "architecture" field; we
/// surface the driver string there, which is the closest available signal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdapterInfo {
    pub vendor: String,
    pub architecture: String,
    pub device: String,
    pub description: String,
}

impl AdapterInfo {
    fn from_wgpu(info: &wgpu::AdapterInfo) -> Self {
        Self {
            vendor: format!("0x{:x}", info.vendor),
            architecture: info.driver.clone(),
            device: format!("0x{:x}", info.device),
            description: info.name.clone(),
        }
    }
}

impl fmt::Display for DeviceLimits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "max_buffer_size={} max_storage_binding={} max_uniform_binding={} \
             workgroup=({}, {}, {}) invocations={} workgroup_storage={} workgroups_per_dim={}",
            self.max_buffer_size,
            self.max_storage_buffer_binding_size,
            self.max_uniform_buffer_binding_size,
            self.max_compute_workgroup_size_x,
            self.max_compute_workgroup_size_y,
            self.max_compute_workgroup_size_z,
            self.max_compute_invocations_per_workgroup,
            self.max_compute_workgroup_storage_size,
            self.max_compute_workgroups_per_dimension,
        )
    }
}

/// Immutable snapshot returned by `get_capabilities`.
#[derive(Debug, Clone)]
pub struct Capabilities {
    pub features: FeatureSet,
    pub limits: DeviceLimits,
    pub adapter_info: AdapterInfo,
    pub epoch: u64,
}

impl Capabilities {
    /// Names of every optional feature this device actually granted, for
    /// human-readable diagnostics (startup logging, bug reports).
    pub fn feature_names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.features.shader_f16 {
            names.push(FEATURE_SHADER_F16);
        }
        if self.features.subgroups {
            names.push(FEATURE_SUBGROUPS);
        }
        if self.features.subgroups_f16 {
            names.push(FEATURE_SUBGROUPS_F16);
        }
        if self.features.timestamp_query {
            names.push(FEATURE_TIMESTAMP_QUERY);
        }
        names
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "epoch {} on {} ({}): features [{}], {}",
            self.epoch,
            self.adapter_info.description,
            self.adapter_info.vendor,
            self.feature_names().join(", "),
            self.limits,
        )
    }
}

struct Inner {
    instance: Option<wgpu::Instance>,
    device: Option<Rc<wgpu::Device>>,
    queue: Option<Rc<wgpu::Queue>>,
    capabilities: Option<Capabilities>,
    epoch: u64,
}

impl Inner {
    fn empty() -> Self {
        Self {
            instance: None,
            device: None,
            queue: None,
            capabilities: None,
            epoch: 0,
        }
    }

    /// Bumps the epoch and clears all live state. Called both by explicit
    /// `destroy()` and by the device-lost callback.
    fn invalidate(&mut self, reason: &str) {
        log::error!("gpu-core: device context invalidated: {reason}");
        self.instance = None;
        self.device = None;
        self.queue = None;
        self.capabilities = None;
        self.epoch = self.epoch.wrapping_add(1);
    }
}

/// A device context. Cloning is cheap (shares the same `Rc<RefCell<Inner>>`);
/// all clones observe the same epoch and the same device-lost invalidation.
#[derive(Clone)]
pub struct DeviceContext {
    inner: Rc<RefCell<Inner>>,
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("epoch", &self.epoch())
            .field("initialized", &self.inner.borrow().device.is_some())
            .finish()
    }
}

impl DeviceContext {
    pub(crate) fn new_uninit() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner::empty())),
        }
    }

    /// Pure environment query: does this process look like it can reach a
    /// WebGPU-class surface at all? Best-effort: on native we attempt a
    /// synchronous adapter probe; on wasm32 we optimistically assume the
    /// embedding browser exposes `navigator.gpu` and let `init_async` be the
    /// source of truth.
    pub fn is_available() -> bool {
        #[cfg(target_arch = "wasm32")]
        {
            true
        }
        #[cfg(not(target_arch = "wasm32"))]
        {
            let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
                backends: wgpu::Backends::PRIMARY,
                ..Default::default()
            });
            pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default())).is_ok()
        }
    }

    /// Native initialization path: tries power-preference hints in order,
    /// then retries device request with no optional features before failing.
    #[cfg(not(target_arch = "wasm32"))]
    pub fn init() -> Result<Self> {
        pollster::block_on(Self::init_async())
    }

    /// Acquires an adapter and device. Available on both native (blocked on
    /// synchronously by `init`) and wasm32 (awaited directly by callers).
    pub async fn init_async() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: if cfg!(target_arch = "wasm32") {
                wgpu::Backends::BROWSER_WEBGPU
            } else {
                wgpu::Backends::PRIMARY
            },
            ..Default::default()
        });

        let mut adapter = None;
        for power_preference in [
            wgpu::PowerPreference::HighPerformance,
            wgpu::PowerPreference::LowPower,
            wgpu::PowerPreference::None,
        ] {
            let request = instance.request_adapter(&wgpu::RequestAdapterOptions {
                power_preference,
                compatible_surface: None,
                force_fallback_adapter: false,
            });
            if let Ok(found) = request.await {
                adapter = Some(found);
                break;
            }
        }
        let adapter = adapter.ok_or(CoreError::DeviceUnavailable)?;

        let adapter_features = adapter.features();
        let adapter_limits = adapter.limits();
        let requested_features = adapter_features & preferred_features();

        let device_result = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("gpu-core device"),
                required_features: requested_features,
                required_limits: adapter_limits.clone(),
                memory_hints: wgpu::MemoryHints::default(),
                experimental_features: wgpu::ExperimentalFeatures::default(),
                trace: wgpu::Trace::Off,
            })
            .await;

        let (device, queue) = match device_result {
            Ok(pair) => pair,
            Err(first_err) => {
                log::warn!(
                    "gpu-core: device request with optional features failed ({first_err}), retrying with none"
                );
                adapter
                    .request_device(&wgpu::DeviceDescriptor {
                        label: Some("gpu-core device (minimal)"),
                        required_features: wgpu::Features::empty(),
                        required_limits: wgpu::Limits::downlevel_webgl2_defaults(),
                        memory_hints: wgpu::MemoryHints::default(),
                        experimental_features: wgpu::ExperimentalFeatures::default(),
                        trace: wgpu::Trace::Off,
                    })
                    .await
                    .map_err(|err| CoreError::DeviceInitFailed {
                        reason: err.to_string(),
                    })?
            }
        };

        let adapter_info = adapter.get_info();
        let ctx = Self::new_uninit();
        Self::install_device_lost_callback(&ctx, &device);

        let wgpu_limits = device.limits();
        let capabilities = Capabilities {
            features: FeatureSet::from_wgpu(device.features()),
            limits: DeviceLimits::from_wgpu(&wgpu_limits),
            adapter_info: AdapterInfo::from_wgpu(&adapter_info),
            epoch: 0,
        };

        {
            let mut inner = ctx.inner.borrow_mut();
            inner.instance = Some(instance);
            inner.device = Some(Rc::new(device));
            inner.queue = Some(Rc::new(queue));
            inner.capabilities = Some(capabilities);
        }

        Ok(ctx)
    }

    /// Registers an externally created device (the headless/Node variant).
    /// Same post-conditions as `init`: capabilities populated, epoch at 0,
    /// a device-lost handler installed.
    pub fn set_device(device: wgpu::Device, queue: wgpu::Queue, adapter_info: Option<AdapterInfo>) -> Self {
        let ctx = Self::new_uninit();
        Self::install_device_lost_callback(&ctx, &device);

        let limits = device.limits();
        let capabilities = Capabilities {
            features: FeatureSet::from_wgpu(device.features()),
            limits: DeviceLimits::from_wgpu(&limits),
            adapter_info: adapter_info.unwrap_or_default(),
            epoch: 0,
        };

        {
            let mut inner = ctx.inner.borrow_mut();
            inner.device = Some(Rc::new(device));
            inner.queue = Some(Rc::new(queue));
            inner.capabilities = Some(capabilities);
        }
        ctx
    }

    fn install_device_lost_callback(ctx: &Self, device: &wgpu::Device) {
        let inner = Rc::clone(&ctx.inner);
        device.set_device_lost_callback(move |reason, message| {
            inner
                .borrow_mut()
                .invalidate(&format!("{reason:?}: {message}"));
        });
    }

    pub fn get_capabilities(&self) -> Result<Capabilities> {
        let inner = self.inner.borrow();
        let mut caps = inner.capabilities.clone().ok_or(CoreError::NotInitialized)?;
        caps.epoch = inner.epoch;
        Ok(caps)
    }

    pub fn get_limits(&self) -> Option<DeviceLimits> {
        self.inner.borrow().capabilities.as_ref().map(|c| c.limits)
    }

    pub fn has_feature(&self, name: &str) -> bool {
        self.inner
            .borrow()
            .capabilities
            .as_ref()
            .map(|c| c.features.has(name))
            .unwrap_or(false)
    }

    pub fn epoch(&self) -> u64 {
        self.inner.borrow().epoch
    }

    /// Idempotent teardown. Bumps the epoch and clears cached state.
    pub fn destroy(&self) {
        self.inner.borrow_mut().invalidate("explicit destroy()");
    }

    pub fn device(&self) -> Result<Rc<wgpu::Device>> {
        self.inner.borrow().device.clone().ok_or(CoreError::NotInitialized)
    }

    pub fn queue(&self) -> Result<Rc<wgpu::Queue>> {
        self.inner.borrow().queue.clone().ok_or(CoreError::NotInitialized)
    }
}

thread_local! {
    static DEFAULT_CONTEXT: RefCell<Option<DeviceContext>> = const { RefCell::new(None) };
}

/// Installs `ctx` as the process-wide default context used by the crate's
/// default Buffer Pool and global Uniform Cache. `init`/`init_async` is
/// single-entry: a second call while a context is already installed replaces
/// it only if the caller explicitly calls `install_default` again; concurrent
/// callers on a single thread simply observe whichever completed first
/// because there is no reentrancy on one thread.
pub fn install_default(ctx: DeviceContext) {
    DEFAULT_CONTEXT.with(|cell| *cell.borrow_mut() = Some(ctx));
}

/// Returns the process-wide default context, if one has been installed.
pub fn default_context() -> Result<DeviceContext> {
    DEFAULT_CONTEXT.with(|cell| cell.borrow().clone().ok_or(CoreError::NotInitialized))
}

/// Convenience: initializes (native only) and installs the default context
/// in one step, returning the context as well.
#[cfg(not(target_arch = "wasm32"))]
pub fn init_default() -> Result<DeviceContext> {
    let ctx = DeviceContext::init()?;
    install_default(ctx.clone());
    Ok(ctx)
}

pub fn destroy_default() {
    if let Ok(ctx) = default_context() {
        ctx.destroy();
    }
    DEFAULT_CONTEXT.with(|cell| *cell.borrow_mut() = None);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_set_maps_exact_names() {
        let fs = FeatureSet {
            shader_f16: true,
            subgroups: false,
            subgroups_f16: false,
            timestamp_query: true,
        };
        assert!(fs.has(FEATURE_SHADER_F16));
        assert!(!fs.has(FEATURE_SUBGROUPS));
        assert!(fs.has(FEATURE_TIMESTAMP_QUERY));
        assert!(!fs.has("not-a-real-feature"));
    }

    #[test]
    fn subgroups_f16_requires_both_constituents() {
        let features = wgpu::Features::SHADER_F16;
        let fs = FeatureSet::from_wgpu(features);
        assert!(fs.shader_f16);
        assert!(!fs.subgroups);
        assert!(!fs.subgroups_f16);
    }

    #[test]
    fn default_context_is_not_initialized_until_installed() {
        destroy_default();
        assert!(matches!(default_context(), Err(CoreError::NotInitialized)));
    }

    #[test]
    fn feature_names_lists_only_granted_features() {
        let caps = Capabilities {
            features: FeatureSet {
                shader_f16: true,
                subgroups: false,
                subgroups_f16: false,
                timestamp_query: true,
            },
            limits: DeviceLimits {
                max_buffer_size: 1,
                max_storage_buffer_binding_size: 1,
                max_uniform_buffer_binding_size: 1,
                max_compute_workgroup_size_x: 1,
                max_compute_workgroup_size_y: 1,
                max_compute_workgroup_size_z: 1,
                max_compute_invocations_per_workgroup: 1,
                max_compute_workgroup_storage_size: 1,
                max_compute_workgroups_per_dimension: 1,
            },
            adapter_info: AdapterInfo::default(),
            epoch: 0,
        };
        assert_eq!(caps.feature_names(), vec![FEATURE_SHADER_F16, FEATURE_TIMESTAMP_QUERY]);
    }
}
