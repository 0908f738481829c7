//! Device configuration.

use std::path::PathBuf;
use std::time::Duration;
use derive_builder::Builder;

use crate::backend::BackendKind;
use crate::event_loop::EventLoopProxy;

/// Which backend `GraphicsDevice::new` may pick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackendPreference {
    /// Try every compiled backend in order of preference; the first that initialises wins.
    #[default]
    Auto,
    /// Use exactly this backend or fail.
    Only(BackendKind),
}

impl BackendPreference {
    /// Backends to attempt, in order.
    pub fn candidates(self) -> Vec<BackendKind> {
        match self {
            BackendPreference::Auto => [BackendKind::Vulkan, BackendKind::Metal, BackendKind::Direct3D12, BackendKind::Software]
                .into_iter()
                .filter(|kind| kind.is_compiled())
                .collect(),
            BackendPreference::Only(kind) => vec![kind],
        }
    }
}

impl From<BackendKind> for BackendPreference {
    fn from(kind: BackendKind) -> Self {
        BackendPreference::Only(kind)
    }
}

/// Knobs of the CPU reference device.
#[derive(Clone, Debug, Builder)]
#[builder(setter(into))]
pub struct SoftwareOptions {
    /// Extra time each submission takes to execute.
    #[builder(default)]
    pub execution_latency: Duration,
    /// Hardware queues per family.
    #[builder(default = "4")]
    pub queues_per_family: u32,
    #[builder(default = "\"Kestrel Software Device\".to_owned()")]
    pub adapter_name: String,
}

impl Default for SoftwareOptions {
    fn default() -> Self {
        Self {
            execution_latency: Duration::ZERO,
            queues_per_family: 4,
            adapter_name: "Kestrel Software Device".to_owned(),
        }
    }
}

#[derive(Clone, Debug, Builder)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
pub struct DeviceConfig {
    #[builder(default)]
    pub backend: BackendPreference,
    /// Enable API validation layers where the backend has them.
    #[builder(default = "cfg!(debug_assertions)")]
    pub validation: bool,
    #[builder(default = "\"kestrel\".to_owned()")]
    pub application_name: String,
    /// Directory of persisted pipeline caches; `None` disables persistence.
    #[builder(default, setter(strip_option))]
    pub pipeline_cache_dir: Option<PathBuf>,
    #[builder(default = "true")]
    pub save_pipeline_cache_on_shutdown: bool,
    /// Upper bound of a single fence wait on the completion thread.
    #[builder(default = "Duration::from_millis(5)")]
    pub fence_poll_interval: Duration,
    /// Event loop that receives completions registered for event-loop delivery.
    #[builder(default, setter(strip_option))]
    pub event_loop: Option<EventLoopProxy>,
    #[builder(default)]
    pub software: SoftwareOptions,
}

impl DeviceConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        if let Some(interval) = self.fence_poll_interval {
            if interval.is_zero() {
                return Err("fence_poll_interval must be non-zero".to_owned());
            }
        }
        if let Some(name) = &self.application_name {
            if name.contains('\0') {
                return Err("application_name must not contain NUL".to_owned());
            }
        }
        Ok(())
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            backend: BackendPreference::Auto,
            validation: cfg!(debug_assertions),
            application_name: "kestrel".to_owned(),
            pipeline_cache_dir: None,
            save_pipeline_cache_on_shutdown: true,
            fence_poll_interval: Duration::from_millis(5),
            event_loop: None,
            software: SoftwareOptions::default(),
        }
    }
}

impl DeviceConfig {
    pub fn builder() -> DeviceConfigBuilder {
        DeviceConfigBuilder::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_match_default() {
        let built = DeviceConfig::builder().build().unwrap();
        let default = DeviceConfig::default();
        assert_eq!(built.backend, default.backend);
        assert_eq!(built.fence_poll_interval, default.fence_poll_interval);
        assert_eq!(built.application_name, "kestrel");
        assert!(built.pipeline_cache_dir.is_none());
    }

    #[test]
    fn builder_validates() {
        assert!(DeviceConfig::builder().fence_poll_interval(Duration::ZERO).build().is_err());

        let config = DeviceConfig::builder()
            .backend(BackendKind::Software)
            .pipeline_cache_dir("/tmp/kestrel")
            .build()
            .unwrap();
        assert_eq!(config.backend, BackendPreference::Only(BackendKind::Software));
        assert_eq!(config.pipeline_cache_dir.as_deref(), Some(std::path::Path::new("/tmp/kestrel")));
    }

    #[test]
    fn auto_prefers_hardware() {
        let candidates = BackendPreference::Auto.candidates();
        assert_eq!(candidates.last(), Some(&BackendKind::Software));
        assert!(!candidates.contains(&BackendKind::Metal));
        assert_eq!(BackendPreference::Only(BackendKind::Metal).candidates(), vec![BackendKind::Metal]);
    }
}
