//! Lifecycle tracking for temporary mask artifacts
//!
//! Adjusted masks are read by several optional stages (crop, solid background, JPG
//! export). Stages register the masks they hold; removal is attempted when a stage
//! finishes and once more at the end of the image. A registered file is never
//! removed: a removal request against it is parked in the pending set and retried
//! by [`ArtifactLifecycleCoordinator::process_pending_cleanup`].
//!
//! Deferral and `save_mask` decisions read the [`ConfigSnapshot`] bound to the
//! image, never live settings.

use crate::config::ConfigSnapshot;
use crate::services::io::{is_png_output_dir, ArtifactKind, ARTIFACT_SUFFIXES, PNG_DIR_NAME};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Marker contained in every lifecycle-managed file name
const ADJUSTED_MASK_MARKER: &str = "_mask_adjusted_";

/// Lifecycle state of one adjusted mask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CleanupState {
    /// At least one stage holds a registration
    ActiveUse,
    /// Removal was requested while in use
    PendingCleanup,
    /// Removed by this coordinator
    Removed,
    /// Not tracked (never registered, or kept on disk)
    Untracked,
}

#[derive(Debug, Default)]
struct Registry {
    in_use: HashMap<PathBuf, usize>,
    pending: HashSet<PathBuf>,
    removed: HashSet<PathBuf>,
    snapshots: HashMap<PathBuf, ConfigSnapshot>,
    owners: HashMap<PathBuf, PathBuf>,
}

impl Registry {
    fn snapshot_for_image(&self, image_path: &Path, fallback: &ConfigSnapshot) -> ConfigSnapshot {
        self.snapshots
            .get(image_path)
            .cloned()
            .unwrap_or_else(|| fallback.clone())
    }

    fn snapshot_for_mask(&self, mask_path: &Path, fallback: &ConfigSnapshot) -> ConfigSnapshot {
        match self.owners.get(mask_path) {
            Some(owner) => self.snapshot_for_image(owner, fallback),
            None => fallback.clone(),
        }
    }

    fn remove_file(&mut self, path: &Path) -> bool {
        match std::fs::remove_file(path) {
            Ok(()) => {
                self.pending.remove(path);
                self.removed.insert(path.to_path_buf());
                true
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.pending.remove(path);
                true
            },
            Err(e) => {
                log::warn!(
                    "⚠️ Failed to remove {} ({e}); will retry on next sweep",
                    path.display()
                );
                self.pending.insert(path.to_path_buf());
                false
            },
        }
    }
}

/// Tracks in-use and pending-cleanup temporary files
#[derive(Debug, Default)]
pub struct ArtifactLifecycleCoordinator {
    registry: Mutex<Registry>,
    default_snapshot: ConfigSnapshot,
}

impl ArtifactLifecycleCoordinator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot used for images that never had one bound
    #[must_use]
    pub fn with_default_snapshot(mut self, snapshot: ConfigSnapshot) -> Self {
        self.default_snapshot = snapshot;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind the config snapshot that governs cleanup for `image_path`
    pub fn bind_snapshot<P: AsRef<Path>>(&self, image_path: P, snapshot: ConfigSnapshot) {
        self.lock()
            .snapshots
            .insert(image_path.as_ref().to_path_buf(), snapshot);
    }

    /// Forget the snapshot and mask ownership recorded for `image_path`
    pub fn release_image<P: AsRef<Path>>(&self, image_path: P) {
        let image_path = image_path.as_ref();
        let mut registry = self.lock();
        registry.snapshots.remove(image_path);
        registry.owners.retain(|_, owner| owner != image_path);
    }

    /// Record that `mask_path` was produced for `image_path`
    pub fn track_artifact<M: AsRef<Path>, I: AsRef<Path>>(&self, mask_path: M, image_path: I) {
        self.lock().owners.insert(
            mask_path.as_ref().to_path_buf(),
            image_path.as_ref().to_path_buf(),
        );
    }

    pub fn register_in_use<P: AsRef<Path>>(&self, path: P) {
        let path = path.as_ref();
        let mut registry = self.lock();
        *registry.in_use.entry(path.to_path_buf()).or_insert(0) += 1;
        registry.removed.remove(path);
        log::debug!("Registered in use: {}", path.display());
    }

    pub fn unregister_in_use<P: AsRef<Path>>(&self, path: P) {
        let path = path.as_ref();
        let mut registry = self.lock();
        if let Some(count) = registry.in_use.get_mut(path) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                registry.in_use.remove(path);
            }
        }
    }

    #[must_use]
    pub fn is_in_use<P: AsRef<Path>>(&self, path: P) -> bool {
        self.lock().in_use.contains_key(path.as_ref())
    }

    /// Current registration count for `path`
    #[must_use]
    pub fn use_count<P: AsRef<Path>>(&self, path: P) -> usize {
        self.lock().in_use.get(path.as_ref()).copied().unwrap_or(0)
    }

    pub fn mark_pending<P: AsRef<Path>>(&self, path: P) {
        self.lock().pending.insert(path.as_ref().to_path_buf());
    }

    #[must_use]
    pub fn pending(&self) -> Vec<PathBuf> {
        let mut pending: Vec<PathBuf> = self.lock().pending.iter().cloned().collect();
        pending.sort();
        pending
    }

    #[must_use]
    pub fn state_of<P: AsRef<Path>>(&self, path: P) -> CleanupState {
        let path = path.as_ref();
        let registry = self.lock();
        if registry.in_use.contains_key(path) {
            CleanupState::ActiveUse
        } else if registry.pending.contains(path) {
            CleanupState::PendingCleanup
        } else if registry.removed.contains(path) {
            CleanupState::Removed
        } else {
            CleanupState::Untracked
        }
    }

    /// Remove an adjusted mask if nothing holds it and `save_mask` is off
    ///
    /// Returns true when the file is gone afterwards. A mask still in use is moved
    /// to the pending set and false is returned.
    pub fn try_cleanup<P: AsRef<Path>>(&self, path: P) -> bool {
        let path = path.as_ref();
        if !is_adjusted_mask(path) {
            log::debug!("Skipping cleanup, not an adjusted mask: {}", path.display());
            return false;
        }

        let mut registry = self.lock();
        if !path.exists() {
            registry.pending.remove(path);
            return true;
        }
        if registry.in_use.contains_key(path) {
            log::info!("🔒 Mask in use, deferring cleanup: {}", path.display());
            registry.pending.insert(path.to_path_buf());
            return false;
        }
        if registry
            .snapshot_for_mask(path, &self.default_snapshot)
            .save_mask
        {
            log::info!("💾 Keeping adjusted mask (save_mask=true): {}", path.display());
            registry.pending.remove(path);
            return false;
        }

        let removed = registry.remove_file(path);
        if removed {
            log::info!("🧹 Removed adjusted mask: {}", path.display());
        }
        removed
    }

    /// Retry every pending removal whose file is no longer in use
    ///
    /// Returns the number of files removed.
    pub fn process_pending_cleanup(&self) -> usize {
        let candidates: Vec<PathBuf> = {
            let registry = self.lock();
            registry
                .pending
                .iter()
                .filter(|p| !registry.in_use.contains_key(*p))
                .cloned()
                .collect()
        };
        if candidates.is_empty() {
            return 0;
        }

        log::debug!("Processing {} pending cleanup item(s)", candidates.len());
        let cleaned = candidates
            .iter()
            .filter(|path| self.try_cleanup(path))
            .count();
        if cleaned > 0 {
            log::info!("🧹 Processed {cleaned} pending cleanup item(s)");
        }
        cleaned
    }

    /// Whether any downstream stage will still read the adjusted mask
    #[must_use]
    pub fn should_defer_cleanup<P: AsRef<Path>>(&self, image_path: P) -> bool {
        let snapshot = self
            .lock()
            .snapshot_for_image(image_path.as_ref(), &self.default_snapshot);
        let defer = snapshot.has_downstream_mask_consumers();
        log::debug!(
            "Cleanup deferral for {}: {defer} (crop={}, solid_bg={}, jpg={})",
            image_path.as_ref().display(),
            snapshot.crop_enabled,
            snapshot.solid_bg_enabled,
            snapshot.jpg_export_enabled
        );
        defer
    }

    /// Cleanup point right after levels adjustment
    ///
    /// Runs the final cleanup only when no downstream stage needs the mask.
    /// Returns the number of masks removed, or `None` when cleanup was left for
    /// a later stage (or `save_mask` keeps the masks).
    pub fn cleanup_after_levels<P: AsRef<Path>>(&self, image_path: P) -> Option<usize> {
        let image_path = image_path.as_ref();
        let snapshot = self
            .lock()
            .snapshot_for_image(image_path, &self.default_snapshot);
        if snapshot.save_mask || self.should_defer_cleanup(image_path) {
            return None;
        }
        Some(self.final_cleanup_for(image_path))
    }

    /// End-of-pipeline cleanup for every adjusted mask belonging to `image_path`
    ///
    /// Only masks tracked for `image_path` are removed. When none were tracked, the
    /// masks found by [`Self::find_related_adjusted_masks`] are used instead.
    /// Registrations are dropped first; files are then removed unless the image's
    /// snapshot has `save_mask` set. Pending items are swept afterwards. Returns
    /// the number of masks removed.
    pub fn final_cleanup_for<P: AsRef<Path>>(&self, image_path: P) -> usize {
        let image_path = image_path.as_ref();
        let (snapshot, mut masks) = {
            let registry = self.lock();
            let owned: Vec<PathBuf> = registry
                .owners
                .iter()
                .filter(|(_, owner)| owner.as_path() == image_path)
                .map(|(mask, _)| mask.clone())
                .collect();
            (
                registry.snapshot_for_image(image_path, &self.default_snapshot),
                owned,
            )
        };

        if snapshot.save_mask {
            log::info!(
                "💾 Final cleanup skipped for {} (save_mask=true)",
                image_path.display()
            );
            self.release_image(image_path);
            return 0;
        }

        // Recorded masks are authoritative; discovery only covers callers that
        // never tracked their masks, since it cannot tell runs apart
        if !masks.iter().any(|m| is_adjusted_mask(m)) {
            masks.extend(Self::find_related_adjusted_masks(image_path));
        }

        let mut cleaned = 0;
        {
            let mut registry = self.lock();
            for mask in &masks {
                registry.in_use.remove(mask);
                if mask.exists() && registry.remove_file(mask) {
                    log::info!("🧹 Final cleanup removed {}", mask.display());
                    cleaned += 1;
                }
            }
        }
        self.release_image(image_path);
        cleaned += self.process_pending_cleanup();

        log::debug!(
            "Final cleanup for {}: {cleaned} mask(s) removed",
            image_path.display()
        );
        cleaned
    }

    /// Remove the raw inference outputs once the refined output exists
    pub fn cleanup_original_temp_files<C: AsRef<Path>, M: AsRef<Path>>(&self, raw_cutout: C, raw_mask: M) {
        let mut registry = self.lock();
        for path in [raw_cutout.as_ref(), raw_mask.as_ref()] {
            if path.exists() && registry.remove_file(path) {
                log::debug!("Removed temporary file: {}", path.display());
            }
        }
    }

    /// Adjusted masks that belong to `image_path`
    ///
    /// For a tagged artifact name the base is the stem with the first artifact
    /// suffix and the trailing 4-digit tag removed; an untagged stem is its own base. The image directory, its `PNG` subfolder and the sibling
    /// `PNG` folder are searched. When the stem carries a tag, only the mask with that
    /// exact tag matches; otherwise `{base}_mask_adjusted_*.png` is globbed.
    #[must_use]
    pub fn find_related_adjusted_masks<P: AsRef<Path>>(image_path: P) -> Vec<PathBuf> {
        let image_path = image_path.as_ref();
        let Some(stem) = image_path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
            return Vec::new();
        };
        let tag = trailing_tag(&stem).map(str::to_string);

        let mut base = stem.as_str();
        if let Some(tag) = &tag {
            base = &base[..base.len() - tag.len() - 1];
            for suffix in ARTIFACT_SUFFIXES {
                if let Some(pos) = base.find(suffix) {
                    if pos > 0 {
                        base = &base[..pos];
                        break;
                    }
                }
            }
        }

        let base_dir = image_path.parent().unwrap_or_else(|| Path::new(""));
        let mut search_dirs = vec![base_dir.to_path_buf()];
        if !is_png_output_dir(base_dir) {
            search_dirs.push(base_dir.join(PNG_DIR_NAME));
        }
        if let Some(parent) = base_dir.parent() {
            search_dirs.push(parent.join(PNG_DIR_NAME));
        }

        let mut found: Vec<PathBuf> = Vec::new();
        for dir in search_dirs.iter().filter(|d| d.is_dir()) {
            match &tag {
                Some(tag) => {
                    let exact = dir.join(format!(
                        "{base}_{}_{tag}.png",
                        ArtifactKind::AdjustedMask.suffix()
                    ));
                    if exact.exists() {
                        found.push(exact);
                    }
                },
                None => {
                    let pattern = dir.join(format!(
                        "{}_{}_*.png",
                        glob::Pattern::escape(base),
                        ArtifactKind::AdjustedMask.suffix()
                    ));
                    let pattern = pattern.to_string_lossy().into_owned();
                    match glob::glob(&pattern) {
                        Ok(paths) => found.extend(paths.filter_map(std::result::Result::ok)),
                        Err(e) => log::warn!("⚠️ Invalid cleanup pattern {pattern}: {e}"),
                    }
                },
            }
        }

        found.sort();
        found.dedup();
        found
    }
}

fn is_adjusted_mask(path: &Path) -> bool {
    path.to_string_lossy().contains(ADJUSTED_MASK_MARKER)
}

/// Trailing `_dddd` tag of a stem, without the underscore
fn trailing_tag(stem: &str) -> Option<&str> {
    let split = stem.len().checked_sub(5)?;
    let digits = stem.get(split..)?.strip_prefix('_')?;
    digits.bytes().all(|b| b.is_ascii_digit()).then_some(digits)
}
