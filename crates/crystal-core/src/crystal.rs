//! Crystal lifecycle controller
//!
//! One crystal per registered data type: it owns the root object, its
//! filer, and its save policy, and orchestrates prepare/load/save/delete.
//! State machine: Unconfigured -(configure)-> Configured
//! -(prepare_and_load)-> Ready -(save)-> Ready -(delete)-> Unconfigured.

use crate::check::{CheckRegistry, DataLocationId};
use crate::serialize::{
    deserialize_object, reconstruct_default, serialize_object, CrystalObject,
};
use crystal_common::{BytePool, CrystalConfig, Error, FilerConfig, Result, SaveFormat, SavePolicy};
use crystal_filer::{resolve_filer, Filer, ObjectStore};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Outcome of a successful `prepare_and_load`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CrystalStartResult {
    /// Existing storage was read and deserialized
    Loaded,
    /// No stored data existed; the root was default-reconstructed
    Created,
    /// The primary file was unreadable and history slot `index` served
    LoadedFromHistory { index: u32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Unconfigured,
    Configured,
    Ready,
}

struct CrystalState {
    phase: Phase,
    config: CrystalConfig,
    filer: Option<Arc<dyn Filer>>,
    start_result: Option<CrystalStartResult>,
    periodic: Option<JoinHandle<()>>,
}

/// Lifecycle controller for one registered data type
///
/// The state-transition guard is an async mutex: it is held across the
/// awaited backend I/O of prepare/load, but never nests with the himo
/// cache or check registry locks.
pub struct Crystal<T: CrystalObject> {
    type_name: String,
    check: Arc<CheckRegistry>,
    pool: BytePool,
    store: Option<Arc<dyn ObjectStore>>,
    object: Arc<RwLock<T>>,
    state: Mutex<CrystalState>,
}

impl<T: CrystalObject> Crystal<T> {
    /// Create an unconfigured crystal for local-backend configurations
    pub fn new(check: Arc<CheckRegistry>, pool: BytePool) -> Arc<Self> {
        Self::build(check, pool, None)
    }

    /// Create an unconfigured crystal that can also resolve
    /// object-store configurations
    pub fn with_store(
        check: Arc<CheckRegistry>,
        pool: BytePool,
        store: Arc<dyn ObjectStore>,
    ) -> Arc<Self> {
        Self::build(check, pool, Some(store))
    }

    fn build(
        check: Arc<CheckRegistry>,
        pool: BytePool,
        store: Option<Arc<dyn ObjectStore>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            type_name: std::any::type_name::<T>().to_string(),
            check,
            pool,
            store,
            object: Arc::new(RwLock::new(T::default())),
            state: Mutex::new(CrystalState {
                phase: Phase::Unconfigured,
                config: CrystalConfig::default(),
                filer: None,
                start_result: None,
                periodic: None,
            }),
        })
    }

    /// The type name used for check-registry identity
    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Shared handle to the root object
    #[must_use]
    pub fn object(&self) -> Arc<RwLock<T>> {
        self.object.clone()
    }

    /// Apply a configuration (Unconfigured/Configured -> Configured)
    pub async fn configure(&self, config: CrystalConfig) -> Result<()> {
        config.validate()?;
        let mut state = self.state.lock().await;
        if state.phase == Phase::Ready {
            return Err(Error::invalid_configuration(
                "crystal is already prepared; delete it before reconfiguring",
            ));
        }
        state.config = config;
        state.phase = Phase::Configured;
        Ok(())
    }

    /// Prepare the backing store and load the root object
    ///
    /// Idempotent: once Ready, the cached start result is returned
    /// without touching the backend again. First-run (no stored data) is
    /// a normal path that default-reconstructs the root.
    pub async fn prepare_and_load(self: &Arc<Self>) -> Result<CrystalStartResult> {
        let mut state = self.state.lock().await;
        if state.phase == Phase::Ready {
            if let Some(result) = state.start_result {
                return Ok(result);
            }
        }
        if state.phase == Phase::Unconfigured {
            return Err(Error::invalid_configuration("crystal is not configured"));
        }

        let config = state.config.clone();
        let filer = resolve_filer(&config.file_config, &self.pool, self.store.clone())?;
        let location = config.file_config.file_location();
        let newly = self
            .check
            .register_data_and_config(DataLocationId::new(self.type_name.clone(), location.clone()));

        let result = match self.run_load(&config, &filer, newly).await {
            Ok(result) => result,
            Err(e) if config.required_for_loading => {
                error!(
                    type_name = %self.type_name,
                    location = %location,
                    error = %e,
                    "required crystal failed to load, aborting startup"
                );
                return Err(e);
            }
            Err(e) => {
                warn!(
                    type_name = %self.type_name,
                    location = %location,
                    error = %e,
                    "crystal load failed, continuing with a default root"
                );
                *self.object.write() = reconstruct_default();
                CrystalStartResult::Created
            }
        };

        state.filer = Some(filer);
        state.start_result = Some(result);
        state.phase = Phase::Ready;
        if config.save_policy == SavePolicy::Periodic && state.periodic.is_none() {
            state.periodic = Some(self.spawn_periodic(config.save_interval));
        }
        Ok(result)
    }

    /// Discard the cached start result and load again from storage
    pub async fn force_reload(self: &Arc<Self>) -> Result<CrystalStartResult> {
        {
            let mut state = self.state.lock().await;
            if state.phase == Phase::Ready {
                state.phase = Phase::Configured;
                state.start_result = None;
            }
        }
        self.prepare_and_load().await
    }

    async fn run_load(
        &self,
        config: &CrystalConfig,
        filer: &Arc<dyn Filer>,
        newly: bool,
    ) -> Result<CrystalStartResult> {
        filer.prepare_and_check(newly).await?;
        if newly {
            debug!(type_name = %self.type_name, "first-time pairing, creating default root");
            *self.object.write() = reconstruct_default();
            return Ok(CrystalStartResult::Created);
        }

        match self.try_load_from(filer, config.save_format).await {
            Ok(Some(value)) => {
                *self.object.write() = value;
                Ok(CrystalStartResult::Loaded)
            }
            Ok(None) => {
                // Known pairing but empty storage: not an error
                *self.object.write() = reconstruct_default();
                Ok(CrystalStartResult::Created)
            }
            Err(e) => {
                for index in 1..=config.file_history_count {
                    let history = resolve_filer(
                        &config.file_config.history_config(index),
                        &self.pool,
                        self.store.clone(),
                    )?;
                    if let Ok(Some(value)) = self.try_load_from(&history, config.save_format).await
                    {
                        warn!(
                            type_name = %self.type_name,
                            index,
                            "primary file unreadable, recovered from history"
                        );
                        *self.object.write() = value;
                        return Ok(CrystalStartResult::LoadedFromHistory { index });
                    }
                }
                Err(e)
            }
        }
    }

    /// Read and deserialize the whole backing file; `None` means empty
    async fn try_load_from(
        &self,
        filer: &Arc<dyn Filer>,
        format: SaveFormat,
    ) -> Result<Option<T>> {
        let size = filer.size().await?;
        if size == 0 {
            return Ok(None);
        }
        let buf = filer.read(0, size as usize, None).await?;
        deserialize_object(buf.as_slice(), format).map(Some)
    }

    /// Serialize the root object and write it through the filer,
    /// rotating the previous file into history first
    ///
    /// A `SavePolicy::None` crystal treats this as a no-op. Concurrent
    /// saves are not serialized against each other; callers needing a
    /// single in-flight save must guard externally.
    pub async fn save(&self) -> Result<()> {
        let (config, filer) = {
            let state = self.state.lock().await;
            if state.config.save_policy == SavePolicy::None {
                return Ok(());
            }
            match state.filer.clone() {
                Some(filer) if state.phase == Phase::Ready => (state.config.clone(), filer),
                _ => return Err(Error::invalid_configuration("crystal is not ready")),
            }
        };

        let data = {
            let object = self.object.read();
            serialize_object(&*object, config.save_format)?
        };

        if config.file_history_count > 0 {
            self.rotate_history(&config).await;
        }

        // Whole-file swap: the stored file is always exactly one
        // serialized root, even across a crash mid-save
        filer.replace(data, None).await
    }

    /// Shift history files and copy the current main file into slot 1
    ///
    /// Best-effort: a failed copy loses that history slot, never the
    /// save itself.
    async fn rotate_history(&self, config: &CrystalConfig) {
        for index in (1..config.file_history_count).rev() {
            self.copy_slot(
                &config.file_config.history_config(index),
                &config.file_config.history_config(index + 1),
            )
            .await;
        }
        self.copy_slot(&config.file_config, &config.file_config.history_config(1))
            .await;
    }

    async fn copy_slot(&self, src: &FilerConfig, dst: &FilerConfig) {
        let result: Result<()> = async {
            let src = resolve_filer(src, &self.pool, self.store.clone())?;
            let size = match src.size().await {
                Ok(size) if size > 0 => size,
                // Nothing to rotate
                Ok(_) => return Ok(()),
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => return Err(e),
            };
            let buf = src.read(0, size as usize, None).await?;
            let dst = resolve_filer(dst, &self.pool, self.store.clone())?;
            dst.replace(bytes::Bytes::copy_from_slice(buf.as_slice()), None)
                .await
        }
        .await;
        if let Err(e) = result {
            warn!(type_name = %self.type_name, error = %e, "history rotation slot copy failed");
        }
    }

    /// Notify the crystal that its root object changed
    ///
    /// Under `SavePolicy::Instant` this saves synchronously; other
    /// policies ignore the notification.
    pub async fn mark_changed(&self) -> Result<()> {
        let instant = {
            let state = self.state.lock().await;
            state.config.save_policy == SavePolicy::Instant
        };
        if instant {
            self.save().await
        } else {
            Ok(())
        }
    }

    /// Delete the backing resource and all history files, then reset to
    /// Unconfigured
    pub async fn delete(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.phase == Phase::Unconfigured {
            return Ok(());
        }
        if let Some(task) = state.periodic.take() {
            task.abort();
        }

        let config = state.config.clone();
        if !config.file_config.is_empty() {
            let filer = resolve_filer(&config.file_config, &self.pool, self.store.clone())?;
            filer.delete().await?;
            for index in 1..=config.file_history_count {
                let history = resolve_filer(
                    &config.file_config.history_config(index),
                    &self.pool,
                    self.store.clone(),
                )?;
                history.delete().await?;
            }
            self.check.remove_data(&DataLocationId::new(
                self.type_name.clone(),
                config.file_config.file_location(),
            ));
        }

        *self.object.write() = reconstruct_default();
        state.filer = None;
        state.start_result = None;
        state.config = CrystalConfig::default();
        state.phase = Phase::Unconfigured;
        Ok(())
    }

    /// Best-effort final flush for orderly shutdown
    ///
    /// Failures are logged and swallowed; partial completion across
    /// crystals is acceptable and resumable via the check registry.
    pub async fn save_on_shutdown(&self) {
        let ready = {
            let state = self.state.lock().await;
            state.phase == Phase::Ready && state.config.save_policy != SavePolicy::None
        };
        if ready {
            if let Err(e) = self.save().await {
                warn!(type_name = %self.type_name, error = %e, "shutdown save failed");
            }
        }
    }

    fn spawn_periodic(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(crystal) = weak.upgrade() else {
                    return;
                };
                if let Err(e) = crystal.save().await {
                    warn!(type_name = %crystal.type_name, error = %e, "periodic save failed");
                }
            }
        })
    }
}
