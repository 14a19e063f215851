use log::warn;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use vibe_gba_core::{IllegalInstructionPolicy, MachineConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum IllegalInstructions {
    #[default]
    Strict,
    Compatible,
}

impl From<IllegalInstructions> for IllegalInstructionPolicy {
    fn from(value: IllegalInstructions) -> Self {
        match value {
            IllegalInstructions::Strict => IllegalInstructionPolicy::Strict,
            IllegalInstructions::Compatible => IllegalInstructionPolicy::Compatible,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "kebab-case")]
pub struct CliConfig {
    pub bios_path: Option<PathBuf>,
    pub skip_bios: bool,
    pub illegal_instructions: IllegalInstructions,
    pub open_bus_value: u32,
    /// Where save-state slots go. Next to the ROM when unset.
    pub state_dir: Option<PathBuf>,
}

impl CliConfig {
    pub fn machine_config(&self) -> MachineConfig {
        MachineConfig {
            illegal_instruction: self.illegal_instructions.into(),
            open_bus_value: self.open_bus_value,
            skip_bios: self.skip_bios,
        }
    }
}

pub fn default_config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        if let Some(appdata) = std::env::var_os("APPDATA") {
            return PathBuf::from(appdata).join("vibegba").join("cli.toml");
        }
    }

    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("vibegba").join("cli.toml");
    }

    if let Some(home) = std::env::var_os("HOME") {
        return PathBuf::from(home)
            .join(".config")
            .join("vibegba")
            .join("cli.toml");
    }

    PathBuf::from("cli.toml")
}

pub fn load_from_file(path: &Path) -> CliConfig {
    let text = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(_) => return CliConfig::default(),
    };

    match toml::from_str::<CliConfig>(&text) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!(
                "Failed to parse config {}: {e}; using defaults",
                path.display()
            );
            CliConfig::default()
        }
    }
}

pub fn save_to_file(path: &Path, cfg: &CliConfig) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let text = toml::to_string_pretty(cfg).map_err(std::io::Error::other)?;
    std::fs::write(path, text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let cfg = load_from_file(&dir.path().join("absent.toml"));
        assert_eq!(cfg, CliConfig::default());
        assert_eq!(cfg.machine_config(), MachineConfig::default());
    }

    #[test]
    fn save_then_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("cli.toml");
        let cfg = CliConfig {
            bios_path: Some(PathBuf::from("/roms/gba_bios.bin")),
            skip_bios: true,
            illegal_instructions: IllegalInstructions::Compatible,
            open_bus_value: 0xDEAD_BEEF,
            state_dir: None,
        };
        save_to_file(&path, &cfg).unwrap();
        assert_eq!(load_from_file(&path), cfg);
    }

    #[test]
    fn kebab_case_keys_and_partial_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cli.toml");
        std::fs::write(&path, "illegal-instructions = \"compatible\"\n").unwrap();
        let cfg = load_from_file(&path);
        assert_eq!(cfg.illegal_instructions, IllegalInstructions::Compatible);
        assert!(!cfg.skip_bios);
        assert_eq!(
            cfg.machine_config().illegal_instruction,
            IllegalInstructionPolicy::Compatible
        );
    }

    #[cfg(unix)]
    #[test]
    fn unserializable_config_is_an_error() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("cli.toml");
        let cfg = CliConfig {
            bios_path: Some(PathBuf::from(OsStr::from_bytes(b"bios\xFF.bin"))),
            ..CliConfig::default()
        };
        assert!(save_to_file(&path, &cfg).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cli.toml");
        std::fs::write(&path, "skip-bios = \"maybe\"").unwrap();
        assert_eq!(load_from_file(&path), CliConfig::default());
    }
}
