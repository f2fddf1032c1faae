use aero_vehicle::{ProfileError, ProfileStore, ProfileValues};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use time::OffsetDateTime;

/// One TOML file per profile under `dir`.
pub struct TomlProfileStore {
    dir: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct ProfileFile {
    name: String,
    #[serde(with = "time::serde::rfc3339")]
    saved_at: OffsetDateTime,
    values: ProfileValues,
}

impl TomlProfileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, name: &str) -> Result<PathBuf, ProfileError> {
        let ok = !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !ok {
            return Err(storage(name, "profile names may only use letters, digits, '-' and '_'"));
        }
        Ok(self.dir.join(format!("{}.toml", name)))
    }

    /// When `name` was saved, if it exists.
    pub fn saved_at(&self, name: &str) -> Result<OffsetDateTime, ProfileError> {
        Ok(self.read(name)?.saved_at)
    }

    fn read(&self, name: &str) -> Result<ProfileFile, ProfileError> {
        let path = self.path(name)?;
        let s = match std::fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(ProfileError::NotFound(name.to_string())),
            Err(e) => return Err(storage(name, e)),
        };
        toml::from_str(&s).map_err(|e| storage(name, e))
    }
}

impl ProfileStore for TomlProfileStore {
    fn save_profile(&self, name: &str, values: &ProfileValues) -> Result<(), ProfileError> {
        let path = self.path(name)?;
        let file = ProfileFile { name: name.to_string(), saved_at: OffsetDateTime::now_utc(), values: values.clone() };
        let s = toml::to_string_pretty(&file).map_err(|e| storage(name, e))?;
        std::fs::create_dir_all(&self.dir).map_err(|e| storage(name, e))?;
        std::fs::write(&path, s).map_err(|e| storage(name, e))
    }

    fn load_profile(&self, name: &str) -> Result<ProfileValues, ProfileError> {
        Ok(self.read(name)?.values)
    }

    fn list_profiles(&self) -> Result<Vec<String>, ProfileError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(storage("*", e)),
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|x| x == "toml"))
            .filter_map(|p| p.file_stem().and_then(|s| s.to_str()).map(str::to_string))
            .collect();
        names.sort();
        Ok(names)
    }
}

fn storage(name: &str, reason: impl ToString) -> ProfileError {
    ProfileError::Storage { name: name.to_string(), reason: reason.to_string() }
}
