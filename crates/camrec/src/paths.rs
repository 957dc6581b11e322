use std::env;
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use directories_next::ProjectDirs;

pub const ENV_CONFIG_DIR: &str = "CAMREC_CONFIG_DIR";
pub const ENV_DATA_DIR: &str = "CAMREC_DATA_DIR";

const QUALIFIER: &str = "org";
const ORGANISATION: &str = "Camrec";
const APPLICATION: &str = "camrec";

#[derive(Debug, Clone)]
pub struct AppPaths {
    config_dir: PathBuf,
    data_dir: PathBuf,
}

impl AppPaths {
    pub fn discover() -> Result<Self> {
        let env_config = env_dir(ENV_CONFIG_DIR);
        let env_data = env_dir(ENV_DATA_DIR);
        if let (Some(config_dir), Some(data_dir)) = (env_config.clone(), env_data.clone()) {
            return Ok(Self {
                config_dir,
                data_dir,
            });
        }

        let project_dirs = ProjectDirs::from(QUALIFIER, ORGANISATION, APPLICATION)
            .ok_or_else(|| anyhow!("failed to determine user directories"))?;
        Ok(Self {
            config_dir: env_config.unwrap_or_else(|| project_dirs.config_dir().to_path_buf()),
            data_dir: env_data.unwrap_or_else(|| project_dirs.data_dir().to_path_buf()),
        })
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("camrec.toml")
    }

    /// Where recordings land when neither the CLI nor the config names a
    /// directory.
    pub fn recordings_dir(&self) -> PathBuf {
        self.data_dir.join("recordings")
    }
}

fn env_dir(key: &str) -> Option<PathBuf> {
    env::var_os(key)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}
