use crate::fake::FakeKernel;
use crate::{EngineSettings, VhdManager};
use std::time::Duration;
use tempfile::TempDir;
use vhdm_tracking::{LockedFile, TrackingStore};

/// A fake kernel plus a tracking store in a scratch directory.
pub struct Fixture<'k> {
    pub kernel: &'k FakeKernel,
    pub store: TrackingStore,
    dir: TempDir,
}

impl<'k> Fixture<'k> {
    pub fn new(kernel: &'k FakeKernel) -> Self {
        let dir = TempDir::new().unwrap();
        let store = TrackingStore::new(
            Box::new(LockedFile::new(dir.path().join("vhd_mapping.json"))),
            5,
        );
        Self { kernel, store, dir }
    }

    pub fn settings(&self) -> EngineSettings {
        EngineSettings {
            settle_timeout: Duration::ZERO,
            settle_poll: Duration::from_millis(1),
            detach_timeout: Duration::from_secs(1),
            lock_dir: self.dir.path().to_path_buf(),
            owner: None,
            default_fs_type: "ext4".to_string(),
        }
    }

    pub fn manager(&self) -> VhdManager<'_> {
        VhdManager::new(self.kernel, self.kernel, &self.store, self.settings())
    }
}
