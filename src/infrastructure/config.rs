use crate::domain::config::{BtSerialConfig, DeviceConfig, GlobalConfig};
use crate::domain::error::{BtSerialError, BtSerialResult};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

const CONFIG_DIR: &str = ".btserial";
const CONFIG_FILE: &str = "config.toml";

fn config_error(message: String) -> BtSerialError {
    BtSerialError::Config { message }
}

/// Configuration manager
///
/// Global settings come from `~/.config/btserial/config.toml`. Devices are
/// read from both the global file and the nearest project
/// `.btserial/config.toml`, project entries after global ones.
pub struct ConfigManager {
    global_config_path: PathBuf,
    project_config_path: Option<PathBuf>,
}

impl ConfigManager {
    pub fn new() -> BtSerialResult<Self> {
        let global_config_path = Self::default_global_config_path()?;
        let project_config_path = std::env::current_dir()
            .ok()
            .and_then(|dir| Self::find_project_config_path(&dir));

        Ok(Self {
            global_config_path,
            project_config_path,
        })
    }

    /// Manager over explicit files instead of the default locations
    pub fn with_paths(global_config_path: PathBuf, project_config_path: Option<PathBuf>) -> Self {
        Self {
            global_config_path,
            project_config_path,
        }
    }

    pub fn load_config(&self) -> BtSerialResult<BtSerialConfig> {
        let mut config = BtSerialConfig::default();

        if self.global_config_path.exists() {
            debug!("Loading global config from {}", self.global_config_path.display());
            config = self.load_config_from_path(&self.global_config_path)?;
        }

        if let Some(project_path) = &self.project_config_path {
            if project_path.exists() {
                debug!("Loading project config from {}", project_path.display());
                let project_config = self.load_config_from_path(project_path)?;
                config.devices.extend(project_config.devices);
            }
        }

        Ok(config)
    }

    /// Write global settings to the global file and devices to the project
    /// file, or to the global file when there is no project
    pub fn save_config(&self, config: &BtSerialConfig) -> BtSerialResult<()> {
        match &self.project_config_path {
            Some(project_path) => {
                self.save_config_to_path(
                    &self.global_config_path,
                    &BtSerialConfig {
                        global: config.global.clone(),
                        devices: Vec::new(),
                    },
                )?;
                self.save_config_to_path(
                    project_path,
                    &BtSerialConfig {
                        global: GlobalConfig::default(),
                        devices: config.devices.clone(),
                    },
                )
            }
            None => self.save_config_to_path(&self.global_config_path, config),
        }
    }

    fn default_global_config_path() -> BtSerialResult<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| config_error("Could not determine home directory".to_string()))?;
        Ok(home.join(".config").join("btserial").join(CONFIG_FILE))
    }

    /// Walk up from `start` looking for `.btserial/config.toml`
    pub fn find_project_config_path(start: &Path) -> Option<PathBuf> {
        let mut path = start;
        loop {
            let config_path = path.join(CONFIG_DIR).join(CONFIG_FILE);
            if config_path.exists() {
                return Some(config_path);
            }
            path = path.parent()?;
        }
    }

    pub fn load_config_from_path(&self, path: &Path) -> BtSerialResult<BtSerialConfig> {
        let content = fs::read_to_string(path).map_err(|e| {
            config_error(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        toml::from_str(&content).map_err(|e| {
            config_error(format!("Failed to parse config file {}: {}", path.display(), e))
        })
    }

    pub fn save_config_to_path(&self, path: &Path, config: &BtSerialConfig) -> BtSerialResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                let dir = parent.display();
                config_error(format!("Failed to create config directory {}: {}", dir, e))
            })?;
        }

        let content = toml::to_string_pretty(config)
            .map_err(|e| config_error(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, content).map_err(|e| {
            config_error(format!("Failed to write config file {}: {}", path.display(), e))
        })
    }

    /// Create `.btserial/config.toml` under `path` with an example device
    pub fn init_project_config(&self, path: &Path) -> BtSerialResult<PathBuf> {
        let config_file = path.join(CONFIG_DIR).join(CONFIG_FILE);
        if config_file.exists() {
            return Err(config_error(format!(
                "Project configuration already exists at {}",
                config_file.display()
            )));
        }

        let example = BtSerialConfig {
            global: GlobalConfig::default(),
            devices: vec![DeviceConfig {
                name: "hc05".to_string(),
                address: "/dev/rfcomm0".to_string(),
                description: "HC-05 module bound with `rfcomm bind`".to_string(),
                delimiter: Some("\\n".to_string()),
                baud_rate: 9600,
            }],
        };
        self.save_config_to_path(&config_file, &example)?;
        Ok(config_file)
    }

    pub fn project_config_path(&self) -> Option<&PathBuf> {
        self.project_config_path.as_ref()
    }

    pub fn global_config_path(&self) -> &PathBuf {
        &self.global_config_path
    }
}
