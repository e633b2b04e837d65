use log::warn;
use std::path::PathBuf;
use std::str::FromStr;

pub const DEFAULT_FPS: u32 = 30;
pub const DEFAULT_SOURCE_NAME: &str = "Pixelmap";
const APP_NAME: &str = "Pixelmap";
const CONFIG_FILE: &str = "lighting_config.json";

pub const MIN_SPEED: f32 = 0.1;
pub const MAX_SPEED: f32 = 5.0;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub fps: u32,
    /// sACN source name shown to receivers.
    pub source_name: String,
    pub config_path: PathBuf,
    /// Global effect speed multiplier.
    pub speed: f32,
    /// Bind address used when the saved document has none.
    pub bind_address: Option<String>,
    /// Record frames in memory instead of opening a network source.
    pub dry_run: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fps: DEFAULT_FPS,
            source_name: DEFAULT_SOURCE_NAME.to_string(),
            config_path: user_config_path(),
            speed: 1.0,
            bind_address: None,
            dry_run: false,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `PIXELMAP_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(path) = lookup("PIXELMAP_CONFIG").filter(|p| !p.is_empty()) {
            config.config_path = PathBuf::from(path);
        }
        if let Some(fps) = parse_var::<u32>(&lookup, "PIXELMAP_FPS") {
            if fps > 0 {
                config.fps = fps;
            } else {
                warn!("[CONFIG] PIXELMAP_FPS must be positive, keeping {}", config.fps);
            }
        }
        if let Some(speed) = parse_var::<f32>(&lookup, "PIXELMAP_SPEED") {
            config.speed = clamp_speed(speed);
        }
        if let Some(name) = lookup("PIXELMAP_SOURCE_NAME").filter(|n| !n.is_empty()) {
            config.source_name = name;
        }
        config.bind_address = lookup("PIXELMAP_BIND").filter(|a| !a.trim().is_empty());
        config.dry_run = matches!(
            lookup("PIXELMAP_DRY_RUN").as_deref(),
            Some("1") | Some("true") | Some("yes")
        );
        config
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("[CONFIG] Ignoring {}={:?}: not a valid value", key, raw);
            None
        }
    }
}

pub fn clamp_speed(speed: f32) -> f32 {
    if speed.is_finite() {
        speed.clamp(MIN_SPEED, MAX_SPEED)
    } else {
        1.0
    }
}

/// Platform location of the persisted document, falling back to the working
/// directory when no home directory is known.
pub fn user_config_path() -> PathBuf {
    app_config_dir(APP_NAME, |key| std::env::var_os(key).map(PathBuf::from))
        .map(|dir| dir.join(CONFIG_FILE))
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE))
}

/// Per-user settings directory for `app`: Application Support on macOS,
/// `%APPDATA%` on Windows, XDG (lowercased name) elsewhere.
fn app_config_dir<F>(app: &str, var: F) -> Option<PathBuf>
where
    F: Fn(&str) -> Option<PathBuf>,
{
    if cfg!(target_os = "macos") {
        home::home_dir().map(|h| h.join("Library").join("Application Support").join(app))
    } else if cfg!(target_os = "windows") {
        var("APPDATA").map(|base| base.join(app))
    } else {
        var("XDG_CONFIG_HOME")
            .filter(|base| !base.as_os_str().is_empty())
            .or_else(|| home::home_dir().map(|h| h.join(".config")))
            .map(|base| base.join(app.to_lowercase()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_with(vars: &[(&str, &str)]) -> EngineConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EngineConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_without_overrides() {
        let config = config_with(&[]);
        assert_eq!(config.fps, 30);
        assert_eq!(config.source_name, "Pixelmap");
        assert_eq!(config.speed, 1.0);
        assert!(config.bind_address.is_none());
        assert!(!config.dry_run);
        assert!(config.config_path.ends_with(CONFIG_FILE));
    }

    #[test]
    fn overrides_apply() {
        let config = config_with(&[
            ("PIXELMAP_CONFIG", "/tmp/show.json"),
            ("PIXELMAP_FPS", "44"),
            ("PIXELMAP_SPEED", "2.5"),
            ("PIXELMAP_BIND", "192.168.1.2"),
            ("PIXELMAP_DRY_RUN", "1"),
        ]);
        assert_eq!(config.config_path, PathBuf::from("/tmp/show.json"));
        assert_eq!(config.fps, 44);
        assert_eq!(config.speed, 2.5);
        assert_eq!(config.bind_address.as_deref(), Some("192.168.1.2"));
        assert!(config.dry_run);
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    #[test]
    fn xdg_dir_takes_lowercase_app_name() {
        let dir = app_config_dir("Pixelmap", |key| {
            (key == "XDG_CONFIG_HOME").then(|| PathBuf::from("/srv/conf"))
        });
        assert_eq!(dir, Some(PathBuf::from("/srv/conf/pixelmap")));
    }

    #[test]
    fn invalid_values_are_ignored() {
        let config = config_with(&[("PIXELMAP_FPS", "fast"), ("PIXELMAP_SPEED", "40")]);
        assert_eq!(config.fps, 30);
        assert_eq!(config.speed, MAX_SPEED);

        assert_eq!(config_with(&[("PIXELMAP_FPS", "0")]).fps, 30);
        assert_eq!(clamp_speed(f32::NAN), 1.0);
    }
}
