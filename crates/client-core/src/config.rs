//! On-disk worker configuration.
//!
//! Lives at `$XDG_CONFIG_HOME/trawler/config.json` and holds the pieces of
//! identity and engine setup that survive restarts. Anything not set here can
//! be supplied (or overridden) on the command line.

use std::io::Write as _;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Persisted worker configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerFileConfig {
    /// Queue endpoint base URL.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// API key presented at registration.
    #[serde(default)]
    pub key: Option<String>,
    /// UCI engine command (binary path or name resolved via PATH).
    #[serde(default)]
    pub engine_command: Option<String>,
    /// Search threads per engine process.
    #[serde(default)]
    pub engine_threads: Option<u32>,
    /// Hash table size per engine process, in MiB.
    #[serde(default)]
    pub engine_hash_mib: Option<u32>,
    /// Number of engine processes to run.
    #[serde(default)]
    pub parallel: Option<u16>,
}

impl WorkerFileConfig {
    fn normalize(&mut self) {
        for field in [&mut self.endpoint, &mut self.key, &mut self.engine_command] {
            *field = field.as_ref().map(|s| s.trim().to_string());
            if matches!(field.as_deref(), Some(s) if s.is_empty()) {
                *field = None;
            }
        }
    }
}

fn xdg_config_home() -> anyhow::Result<PathBuf> {
    if let Some(dir) = std::env::var_os("XDG_CONFIG_HOME") {
        let dir = PathBuf::from(dir);
        if dir.as_os_str().is_empty() {
            anyhow::bail!("XDG_CONFIG_HOME is set but empty");
        }
        return Ok(dir);
    }

    let home = std::env::var_os("HOME").ok_or_else(|| anyhow::anyhow!("HOME is not set"))?;
    let home = PathBuf::from(home);
    if home.as_os_str().is_empty() {
        anyhow::bail!("HOME is set but empty");
    }
    Ok(home.join(".config"))
}

/// Path of the config file.
pub fn config_path() -> anyhow::Result<PathBuf> {
    Ok(xdg_config_home()?.join("trawler").join("config.json"))
}

/// Load the config file, if present.
pub fn load_config() -> anyhow::Result<Option<WorkerFileConfig>> {
    let path = config_path()?;
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(&path)?;
    let mut cfg: WorkerFileConfig = serde_json::from_str(&raw)?;
    cfg.normalize();
    Ok(Some(cfg))
}

/// Save the config file, creating parent directories as needed.
pub fn save_config(cfg: &WorkerFileConfig) -> anyhow::Result<()> {
    let path = config_path()?;
    let dir = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("invalid config path: {}", path.display()))?;
    std::fs::create_dir_all(dir)?;

    let mut cfg = cfg.clone();
    cfg.normalize();

    let json = serde_json::to_string_pretty(&cfg)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}

/// Load the config, prompting interactively on first run when possible.
///
/// Non-interactive callers get `Ok(None)` when no file exists; a corrupt file
/// is an error unless we can prompt the user to recreate it.
pub fn ensure_config(interactive: bool) -> anyhow::Result<Option<WorkerFileConfig>> {
    match load_config() {
        Ok(Some(cfg)) => return Ok(Some(cfg)),
        Ok(None) => {}
        Err(err) => {
            if !interactive {
                return Err(err);
            }
            eprintln!("warning: failed to read worker config (will recreate): {err:#}");
        }
    }
    if !interactive {
        return Ok(None);
    }

    let cfg = prompt_config()?;
    save_config(&cfg)?;
    Ok(Some(cfg))
}

fn prompt_line(prompt: &str) -> anyhow::Result<String> {
    let mut out = std::io::stdout();
    out.write_all(prompt.as_bytes())?;
    out.flush()?;

    let mut buf = String::new();
    std::io::stdin().read_line(&mut buf)?;
    Ok(buf.trim().to_string())
}

fn prompt_config() -> anyhow::Result<WorkerFileConfig> {
    let path = config_path()?;
    println!("First-run setup (saved to {}).", path.display());
    println!("Press ENTER to leave a field empty.");

    let key = prompt_line("API key: ")?;
    let endpoint = loop {
        let v = prompt_line("Queue endpoint URL: ")?;
        if v.is_empty() || v.starts_with("http://") || v.starts_with("https://") {
            break v;
        }
        println!("Invalid endpoint: expected an http(s):// URL (or leave empty).");
    };

    let mut cfg = WorkerFileConfig {
        endpoint: Some(endpoint),
        key: Some(key),
        ..WorkerFileConfig::default()
    };
    cfg.normalize();
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_drops_blank_fields() {
        let mut cfg = WorkerFileConfig {
            endpoint: Some("  https://queue.example  ".to_string()),
            key: Some("   ".to_string()),
            engine_command: Some(String::new()),
            ..WorkerFileConfig::default()
        };
        cfg.normalize();
        assert_eq!(cfg.endpoint.as_deref(), Some("https://queue.example"));
        assert_eq!(cfg.key, None);
        assert_eq!(cfg.engine_command, None);
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        let cfg: WorkerFileConfig = serde_json::from_str(
            r#"{"key": "abc", "future_field": {"nested": true}}"#,
        )
        .unwrap();
        assert_eq!(cfg.key.as_deref(), Some("abc"));
    }
}
