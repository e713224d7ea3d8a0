use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};

use crate::package::PackageTask;
use crate::upload::UploadTask;
use crate::{Error, Result, lock_unpoisoned};

pub const TASK_ID_LEN: usize = 16;
pub const MAX_ID_ATTEMPTS: usize = 32;

pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> String;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RandomIdGenerator;

impl IdGenerator for RandomIdGenerator {
    fn next_id(&self) -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(TASK_ID_LEN)
            .map(char::from)
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskListing {
    pub uploads: Vec<String>,
    pub packages: Vec<String>,
}

#[derive(Default)]
struct RegistryInner {
    uploads: HashMap<String, Arc<UploadTask>>,
    packages: HashMap<String, Arc<PackageTask>>,
}

impl RegistryInner {
    fn contains(&self, id: &str) -> bool {
        self.uploads.contains_key(id) || self.packages.contains_key(id)
    }
}

/// Owner of every live task. One lock covers both maps and is never held
/// across filesystem I/O.
pub struct TaskRegistry {
    ids: Box<dyn IdGenerator>,
    inner: Mutex<RegistryInner>,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::with_id_generator(RandomIdGenerator)
    }

    pub fn with_id_generator(ids: impl IdGenerator + 'static) -> Self {
        Self {
            ids: Box::new(ids),
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    /// Allocates an id and stores the task built from it. `build` runs under
    /// the registry lock and must not touch the filesystem.
    pub fn insert_upload(&self, build: impl FnOnce(&str) -> UploadTask) -> Result<Arc<UploadTask>> {
        let mut inner = lock_unpoisoned(&self.inner);
        let id = self.allocate(&inner)?;
        let task = Arc::new(build(&id));
        inner.uploads.insert(id, task.clone());
        Ok(task)
    }

    pub fn insert_package(
        &self,
        build: impl FnOnce(&str) -> PackageTask,
    ) -> Result<Arc<PackageTask>> {
        let mut inner = lock_unpoisoned(&self.inner);
        let id = self.allocate(&inner)?;
        let task = Arc::new(build(&id));
        inner.packages.insert(id, task.clone());
        Ok(task)
    }

    fn allocate(&self, inner: &RegistryInner) -> Result<String> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = self.ids.next_id();
            if !inner.contains(&id) {
                return Ok(id);
            }
            tracing::debug!(event = "task.id_collision", task_id = %id, "task.id_collision");
        }
        Err(Error::TaskAllocationExhausted {
            attempts: MAX_ID_ATTEMPTS,
        })
    }

    pub fn upload(&self, id: &str) -> Result<Arc<UploadTask>> {
        lock_unpoisoned(&self.inner)
            .uploads
            .get(id)
            .cloned()
            .ok_or_else(|| Error::task_not_found(id))
    }

    pub fn package(&self, id: &str) -> Result<Arc<PackageTask>> {
        lock_unpoisoned(&self.inner)
            .packages
            .get(id)
            .cloned()
            .ok_or_else(|| Error::task_not_found(id))
    }

    pub fn remove_upload(&self, id: &str) -> Result<Arc<UploadTask>> {
        lock_unpoisoned(&self.inner)
            .uploads
            .remove(id)
            .ok_or_else(|| Error::task_not_found(id))
    }

    pub fn remove_package(&self, id: &str) -> Result<Arc<PackageTask>> {
        lock_unpoisoned(&self.inner)
            .packages
            .remove(id)
            .ok_or_else(|| Error::task_not_found(id))
    }

    /// Removes the upload only if `expired` still holds under the lock.
    pub fn remove_upload_if(
        &self,
        id: &str,
        expired: impl FnOnce(&UploadTask) -> bool,
    ) -> Option<Arc<UploadTask>> {
        let mut inner = lock_unpoisoned(&self.inner);
        if !inner.uploads.get(id).is_some_and(|t| expired(t.as_ref())) {
            return None;
        }
        inner.uploads.remove(id)
    }

    pub fn remove_package_if(
        &self,
        id: &str,
        expired: impl FnOnce(&PackageTask) -> bool,
    ) -> Option<Arc<PackageTask>> {
        let mut inner = lock_unpoisoned(&self.inner);
        if !inner.packages.get(id).is_some_and(|t| expired(t.as_ref())) {
            return None;
        }
        inner.packages.remove(id)
    }

    pub fn uploads(&self) -> Vec<Arc<UploadTask>> {
        lock_unpoisoned(&self.inner).uploads.values().cloned().collect()
    }

    pub fn packages(&self) -> Vec<Arc<PackageTask>> {
        lock_unpoisoned(&self.inner).packages.values().cloned().collect()
    }

    pub fn list(&self) -> TaskListing {
        let inner = lock_unpoisoned(&self.inner);
        let mut uploads: Vec<String> = inner.uploads.keys().cloned().collect();
        let mut packages: Vec<String> = inner.packages.keys().cloned().collect();
        uploads.sort();
        packages.sort();
        TaskListing { uploads, packages }
    }

    pub fn len(&self) -> usize {
        let inner = lock_unpoisoned(&self.inner);
        inner.uploads.len() + inner.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
