//! Persisted program settings.

use std::path::PathBuf;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Serialize, Deserialize, Default)]
pub struct Config {
    auto_update_rooms: bool,

    #[serde(skip_serializing, skip_deserializing)]
    must_save: bool,
}

impl Config {
    pub fn load() -> Config {
        let Some(config_dir) = config_dir() else {
            warn!("could not determine a config directory, using defaults");
            return Config::default();
        };
        let config_file = config_dir.join("config.toml");
        if !config_file.exists() {
            return Config::default();
        }
        match std::fs::read_to_string(&config_file)
            .map_err(|error| error.to_string())
            .and_then(|text| toml::from_str(&text).map_err(|error| error.to_string()))
        {
            Ok(config) => config,
            Err(error) => {
                warn!(%error, "unable to read config, using defaults");
                Config::default()
            }
        }
    }

    pub fn auto_update_rooms(&self) -> bool {
        self.auto_update_rooms
    }

    pub fn set_auto_update_rooms(&mut self, value: bool) {
        self.must_save = true;
        self.auto_update_rooms = value;
    }

    pub fn save(&mut self) {
        if !self.must_save {
            return;
        }
        self.must_save = false;
        let Some(config_dir) = config_dir() else {
            warn!("could not determine a config directory, not saving");
            return;
        };
        let text = toml::to_string(self).expect("config always serializes");
        if let Err(error) = std::fs::write(config_dir.join("config.toml"), text) {
            warn!(%error, "failed to save config");
        }
    }
}

fn config_dir() -> Option<PathBuf> {
    let dirs = ProjectDirs::from("org", "wayfinder", "wayfinder")?;
    if !dirs.config_dir().exists() {
        std::fs::create_dir_all(dirs.config_dir()).ok()?;
    }
    Some(dirs.config_dir().to_owned())
}

/// The default directory holding the map and label databases.
pub fn default_data_dir() -> PathBuf {
    match ProjectDirs::from("org", "wayfinder", "wayfinder") {
        Some(dirs) => {
            let data_dir = dirs.data_dir().to_owned();
            if !data_dir.exists() {
                if let Err(error) = std::fs::create_dir_all(&data_dir) {
                    warn!(%error, "failed to create the data directory");
                }
            }
            data_dir
        }
        None => PathBuf::from("."),
    }
}
