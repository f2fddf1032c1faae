use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

pub type ProfileValues = BTreeMap<String, f32>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProfileError {
    #[error("profile {0} not found")]
    NotFound(String),

    #[error("profile {name}: {reason}")]
    Storage { name: String, reason: String },
}

/// Where named parameter snapshots live. Implementations must be safe to share across tasks.
pub trait ProfileStore: Send + Sync {
    fn save_profile(&self, name: &str, values: &ProfileValues) -> Result<(), ProfileError>;
    fn load_profile(&self, name: &str) -> Result<ProfileValues, ProfileError>;
    fn list_profiles(&self) -> Result<Vec<String>, ProfileError>;
}

#[derive(Default)]
pub struct MemoryProfileStore {
    profiles: Mutex<HashMap<String, ProfileValues>>,
}

impl MemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProfileStore for MemoryProfileStore {
    fn save_profile(&self, name: &str, values: &ProfileValues) -> Result<(), ProfileError> {
        self.profiles.lock().unwrap().insert(name.to_string(), values.clone());
        Ok(())
    }

    fn load_profile(&self, name: &str) -> Result<ProfileValues, ProfileError> {
        self.profiles.lock().unwrap().get(name).cloned().ok_or_else(|| ProfileError::NotFound(name.to_string()))
    }

    fn list_profiles(&self) -> Result<Vec<String>, ProfileError> {
        let mut names: Vec<String> = self.profiles.lock().unwrap().keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}
