/* --------------------------
Preferences and directories
    - Credentials (username, password, host, port) live in config.yaml under
      the platform config dir, written 0o600 since the password is in there.
    - prepare_directories() makes every directory we touch ahead of time, so
      later unwraps on dirs::data_dir are safe.
-------------------------- */

use std::error::Error;
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;

use dialoguer::{Input, Password};
use dirs::{config_dir, data_dir};
use serde::{Deserialize, Serialize};

const APP_DIR: &str = "downbeat";
const DEFAULT_PORT: u16 = 22222;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub host: String,
    pub port: u16,
}

impl Credentials {
    /// Connecting needs every field; empty strings count as missing.
    pub fn complete(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty() && !self.host.is_empty()
    }
}

/// Creates every directory the app writes into. Called once at startup.
pub fn prepare_directories() -> Result<(), Box<dyn Error>> {
    let data_dir = data_dir().ok_or("could not find data directory")?;
    let config_dir = config_dir().ok_or("could not find config directory")?;

    let app_data = data_dir.join(APP_DIR);
    std::fs::create_dir_all(config_dir.join(APP_DIR))?;
    std::fs::create_dir_all(app_data.join("log"))?;
    std::fs::create_dir_all(app_data.join("albums"))?;
    std::fs::create_dir_all(app_data.join("downloads"))?;

    Ok(())
}

pub fn log_dir() -> PathBuf {
    data_dir().expect("data directory vanished").join(APP_DIR).join("log")
}

/// Album covers live here, one PNG per album.
pub fn cover_dir() -> PathBuf {
    data_dir().expect("data directory vanished").join(APP_DIR).join("albums")
}

pub fn download_dir() -> PathBuf {
    data_dir()
        .expect("data directory vanished")
        .join(APP_DIR)
        .join("downloads")
}

fn config_file() -> Result<PathBuf, Box<dyn Error>> {
    let config_dir = config_dir().ok_or("could not find config directory")?;
    Ok(config_dir.join(APP_DIR).join("config.yaml"))
}

pub fn get_credentials() -> Result<Option<Credentials>, Box<dyn Error>> {
    let path = config_file()?;
    if !path.exists() {
        return Ok(None);
    }
    let f = std::fs::File::open(&path)?;
    let credentials: Credentials = serde_yaml::from_reader(f)?;
    Ok(Some(credentials))
}

pub fn store_credentials(credentials: &Credentials) -> Result<(), Box<dyn Error>> {
    let path = config_file()?;
    let yaml = serde_yaml::to_string(credentials)?;
    let _ = std::fs::remove_file(&path);
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(&path)?;
    file.write_all(yaml.as_bytes())?;
    Ok(())
}

/// Rewrites the config with the login fields blanked. Host and port survive,
/// so the next login only asks for the user again.
pub fn clear_credentials() -> Result<(), Box<dyn Error>> {
    if let Some(mut credentials) = get_credentials()? {
        credentials.username = String::new();
        credentials.password = String::new();
        store_credentials(&credentials)?;
    }
    Ok(())
}

/// First-run prompt. Only used interactively from main, hence the expects.
pub fn prompt_credentials(existing: Option<Credentials>) -> Credentials {
    println!("--- downbeat configuration ---");

    let (default_host, default_port) = match &existing {
        Some(c) => (c.host.clone(), c.port),
        None => ("localhost".to_string(), DEFAULT_PORT),
    };

    let host: String = Input::new()
        .with_prompt("host")
        .default(default_host)
        .interact_text()
        .expect(" ! Failed to read host");
    let port: u16 = Input::new()
        .with_prompt("port")
        .default(default_port)
        .interact_text()
        .expect(" ! Failed to read port");
    let username: String = Input::new()
        .with_prompt("username")
        .interact_text()
        .expect(" ! Failed to read username");
    let password: String = Password::new()
        .with_prompt("password")
        .interact()
        .expect(" ! Failed to read password");

    Credentials { username, password, host, port }
}
