//! Persistent pipeline cache.
//!
//! One file per device identity holds the backend's opaque cache blob plus the fingerprints of
//! every pipeline compiled so far. Files written by another backend, adapter, driver or format
//! version are discarded on load, and so are files that fail to decode or checksum. Live
//! pipelines are additionally deduplicated in memory by descriptor fingerprint.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Weak;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use kestrel_core::collections::hashmap::HashMap;
use kestrel_core::collections::hashset::HashSet;
use kestrel_core::collections::stable_hash;

use crate::backend::{BackendKind, DeviceBackend};
use crate::error::{RhiError, RhiResult};
use crate::pipeline::{ComputePipeline, ComputePipelineDescriptor, PipelineInner, RenderPipeline, RenderPipelineDescriptor};

const MAGIC: [u8; 4] = *b"KPCF";
const FORMAT_VERSION: u32 = 1;
const MAX_FILE_SIZE: usize = 256 << 20;

/// Device identity a cache file is valid for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PipelineCacheKey {
    pub backend: BackendKind,
    pub vendor_id: u32,
    pub device_id: u32,
    pub driver_version: u32,
    pub pipeline_cache_uuid: [u8; 16],
}

impl PipelineCacheKey {
    pub fn of(backend: &dyn DeviceBackend) -> Self {
        let info = backend.adapter_info();
        Self {
            backend: backend.kind(),
            vendor_id: info.vendor_id,
            device_id: info.device_id,
            driver_version: info.driver_version,
            pipeline_cache_uuid: info.pipeline_cache_uuid,
        }
    }

    pub fn file_name(&self) -> String {
        format!("pipeline-cache-{}-{:08x}-{:08x}.bin", self.backend.name(), self.vendor_id, self.device_id)
    }
}

#[derive(Debug, Clone, Hash, Serialize, Deserialize)]
struct CachePayload {
    backend_blob: Vec<u8>,
    fingerprints: Vec<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    magic: [u8; 4],
    format_version: u32,
    key: PipelineCacheKey,
    checksum: u64,
    payload: CachePayload,
}

fn bincode_config() -> impl bincode::config::Config {
    bincode::config::standard().with_limit::<MAX_FILE_SIZE>()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineCacheStats {
    /// Fingerprints restored from disk at device creation.
    pub loaded: usize,
    /// Pipelines compiled whose fingerprint was already known.
    pub hits: u64,
    /// Pipelines compiled for the first time.
    pub misses: u64,
    /// Creations answered with an already live pipeline.
    pub reused: u64,
    /// Known fingerprints.
    pub entries: usize,
}

#[derive(Default)]
pub(crate) struct CacheState {
    fingerprints: HashSet<u64>,
    live_render: HashMap<u64, Weak<PipelineInner<RenderPipelineDescriptor>>>,
    live_compute: HashMap<u64, Weak<PipelineInner<ComputePipelineDescriptor>>>,
    stats: PipelineCacheStats,
}

/// Pipeline handle kinds tracked by the cache.
pub(crate) trait CachedPipeline: Sized {
    type Descriptor;

    fn live(state: &mut CacheState) -> &mut HashMap<u64, Weak<PipelineInner<Self::Descriptor>>>;
    fn weak(&self) -> Weak<PipelineInner<Self::Descriptor>>;
    fn strong(weak: &Weak<PipelineInner<Self::Descriptor>>) -> Option<Self>;
}

impl CachedPipeline for RenderPipeline {
    type Descriptor = RenderPipelineDescriptor;

    fn live(state: &mut CacheState) -> &mut HashMap<u64, Weak<PipelineInner<RenderPipelineDescriptor>>> {
        &mut state.live_render
    }

    fn weak(&self) -> Weak<PipelineInner<RenderPipelineDescriptor>> {
        self.downgrade()
    }

    fn strong(weak: &Weak<PipelineInner<RenderPipelineDescriptor>>) -> Option<Self> {
        Self::upgrade(weak)
    }
}

impl CachedPipeline for ComputePipeline {
    type Descriptor = ComputePipelineDescriptor;

    fn live(state: &mut CacheState) -> &mut HashMap<u64, Weak<PipelineInner<ComputePipelineDescriptor>>> {
        &mut state.live_compute
    }

    fn weak(&self) -> Weak<PipelineInner<ComputePipelineDescriptor>> {
        self.downgrade()
    }

    fn strong(weak: &Weak<PipelineInner<ComputePipelineDescriptor>>) -> Option<Self> {
        Self::upgrade(weak)
    }
}

pub(crate) struct PipelineCache {
    key: PipelineCacheKey,
    path: Option<PathBuf>,
    state: Mutex<CacheState>,
}

impl PipelineCache {
    /// Open the cache of `backend`'s device identity under `dir`, seeding the backend with the
    /// persisted blob. Never fails: anything unusable on disk yields an empty cache.
    #[profiling::function]
    pub(crate) fn open(dir: Option<&Path>, backend: &dyn DeviceBackend) -> Self {
        let key = PipelineCacheKey::of(backend);
        let path = dir.map(|dir| dir.join(key.file_name()));
        let mut state = CacheState::default();

        if let Some(path) = &path {
            match read_cache_file(path, &key) {
                Ok(Some(payload)) => match backend.load_pipeline_cache(&payload.backend_blob) {
                    Ok(()) => {
                        state.fingerprints.extend(payload.fingerprints);
                        state.stats.loaded = state.fingerprints.len();
                        log::info!("pipeline cache: loaded {} entries from {}", state.stats.loaded, path.display());
                    }
                    Err(err) => log::warn!("pipeline cache: backend rejected {} ({err}); starting empty", path.display()),
                },
                Ok(None) => log::debug!("pipeline cache: no usable file at {}", path.display()),
                Err(err) => log::warn!("pipeline cache: failed to read {} ({err}); starting empty", path.display()),
            }
        }

        Self {
            key,
            path,
            state: Mutex::new(state),
        }
    }

    #[inline]
    pub(crate) fn key(&self) -> &PipelineCacheKey {
        &self.key
    }

    #[inline]
    pub(crate) fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// A live pipeline with this fingerprint, if one still exists.
    pub(crate) fn find_live<P: CachedPipeline>(&self, fingerprint: u64) -> Option<P> {
        let mut state = self.state.lock();
        let live = P::live(&mut state);
        let found = live.get(&fingerprint).and_then(P::strong);
        if found.is_none() {
            live.remove(&fingerprint);
        } else {
            state.stats.reused += 1;
        }
        found
    }

    /// Record a freshly compiled pipeline. Returns whether its fingerprint was already known.
    pub(crate) fn insert<P: CachedPipeline>(&self, fingerprint: u64, pipeline: &P) -> bool {
        let mut state = self.state.lock();
        P::live(&mut state).insert(fingerprint, pipeline.weak());
        let hit = !state.fingerprints.insert(fingerprint);
        if hit {
            state.stats.hits += 1;
        } else {
            state.stats.misses += 1;
        }
        hit
    }

    pub(crate) fn stats(&self) -> PipelineCacheStats {
        let state = self.state.lock();
        PipelineCacheStats {
            entries: state.fingerprints.len(),
            ..state.stats
        }
    }

    /// Write the cache file. Returns the path written, or `None` when persistence is disabled.
    #[profiling::function]
    pub(crate) fn save(&self, backend: &dyn DeviceBackend) -> RhiResult<Option<PathBuf>> {
        let Some(path) = &self.path else {
            return Ok(None);
        };

        let mut fingerprints: Vec<u64> = self.state.lock().fingerprints.iter().copied().collect();
        fingerprints.sort_unstable();
        let payload = CachePayload {
            backend_blob: backend.pipeline_cache_data()?,
            fingerprints,
        };
        let file = CacheFile {
            magic: MAGIC,
            format_version: FORMAT_VERSION,
            key: self.key.clone(),
            checksum: stable_hash(&payload),
            payload,
        };
        let bytes = bincode::serde::encode_to_vec(&file, bincode_config())
            .map_err(|err| RhiError::Backend(format!("pipeline cache encode failed: {err}")))?;

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let staging = path.with_extension("bin.tmp");
        fs::write(&staging, &bytes)?;
        fs::rename(&staging, path)?;

        log::info!(
            "pipeline cache: saved {} entries ({} bytes) to {}",
            file.payload.fingerprints.len(),
            bytes.len(),
            path.display()
        );
        Ok(Some(path.clone()))
    }
}

/// Decode `path`. `Ok(None)` means missing, foreign or corrupt; the reason is logged.
fn read_cache_file(path: &Path, key: &PipelineCacheKey) -> RhiResult<Option<CachePayload>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    if !bytes.starts_with(&MAGIC) {
        log::warn!("pipeline cache: {} is not a cache file; discarding", path.display());
        return Ok(None);
    }
    let file: CacheFile = match bincode::serde::decode_from_slice(&bytes, bincode_config()) {
        Ok((file, _)) => file,
        Err(err) => {
            log::warn!("pipeline cache: {} is corrupt ({err}); discarding", path.display());
            return Ok(None);
        }
    };
    if file.format_version != FORMAT_VERSION {
        log::warn!(
            "pipeline cache: {} has format version {}, expected {FORMAT_VERSION}; discarding",
            path.display(),
            file.format_version
        );
        return Ok(None);
    }
    if &file.key != key {
        log::info!("pipeline cache: {} belongs to another device or driver; discarding", path.display());
        return Ok(None);
    }
    if stable_hash(&file.payload) != file.checksum {
        log::warn!("pipeline cache: checksum mismatch in {}; discarding", path.display());
        return Ok(None);
    }
    Ok(Some(file.payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> PipelineCacheKey {
        PipelineCacheKey {
            backend: BackendKind::Software,
            vendor_id: 0x4b53,
            device_id: 1,
            driver_version: 3,
            pipeline_cache_uuid: [7; 16],
        }
    }

    fn write(path: &Path, file: &CacheFile) {
        fs::write(path, bincode::serde::encode_to_vec(file, bincode_config()).unwrap()).unwrap();
    }

    fn valid_file() -> CacheFile {
        let payload = CachePayload {
            backend_blob: vec![1, 2, 3],
            fingerprints: vec![10, 20],
        };
        CacheFile {
            magic: MAGIC,
            format_version: FORMAT_VERSION,
            key: key(),
            checksum: stable_hash(&payload),
            payload,
        }
    }

    #[test]
    fn reads_back_a_valid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(key().file_name());
        write(&path, &valid_file());

        let payload = read_cache_file(&path, &key()).unwrap().unwrap();
        assert_eq!(payload.backend_blob, vec![1, 2, 3]);
        assert_eq!(payload.fingerprints, vec![10, 20]);
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_cache_file(&dir.path().join("absent.bin"), &key()).unwrap().is_none());
    }

    #[test]
    fn discards_foreign_and_damaged_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.bin");

        fs::write(&path, b"definitely not a cache").unwrap();
        assert!(read_cache_file(&path, &key()).unwrap().is_none());

        let mut truncated = MAGIC.to_vec();
        truncated.extend([0xff; 3]);
        fs::write(&path, truncated).unwrap();
        assert!(read_cache_file(&path, &key()).unwrap().is_none());

        let mut file = valid_file();
        file.format_version = FORMAT_VERSION + 1;
        write(&path, &file);
        assert!(read_cache_file(&path, &key()).unwrap().is_none());

        let mut file = valid_file();
        file.key.driver_version += 1;
        write(&path, &file);
        assert!(read_cache_file(&path, &key()).unwrap().is_none());

        let mut file = valid_file();
        file.payload.fingerprints.push(30);
        write(&path, &file);
        assert!(read_cache_file(&path, &key()).unwrap().is_none(), "checksum must cover the payload");
    }

    #[test]
    fn file_name_encodes_identity() {
        assert_eq!(key().file_name(), "pipeline-cache-software-00004b53-00000001.bin");
    }
}
