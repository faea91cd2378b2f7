use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub const DEFAULT_APPLETS_DIR: &str = "/usr/share/cafe-panel/applets";

/// Stores all the paths relevant to the panel.
#[derive(Debug, Clone)]
pub struct PanelPaths {
    pub applet_dirs: Vec<PathBuf>,
    pub ipc_socket_file: PathBuf,
    pub layout_file: PathBuf,
}

impl PanelPaths {
    pub fn from_env(layout_file: Option<PathBuf>) -> Result<Self> {
        let applet_dirs = applet_dirs_from(std::env::var("CAFE_PANEL_APPLETS_DIR").ok().as_deref());

        let ipc_socket_file = std::env::var("XDG_RUNTIME_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
            .join("cafe-panel.sock");

        let layout_file = match layout_file {
            Some(layout_file) => layout_file,
            None => config_home()?.join("cafe-panel").join("layout.json"),
        };

        Ok(PanelPaths { applet_dirs, ipc_socket_file, layout_file })
    }

    pub fn get_ipc_socket_file(&self) -> &Path {
        self.ipc_socket_file.as_path()
    }

    pub fn get_layout_file(&self) -> &Path {
        self.layout_file.as_path()
    }
}

fn config_home() -> Result<PathBuf> {
    if let Ok(config_home) = std::env::var("XDG_CONFIG_HOME") {
        return Ok(PathBuf::from(config_home));
    }
    let home = std::env::var("HOME").context("Neither XDG_CONFIG_HOME nor HOME is set")?;
    Ok(PathBuf::from(home).join(".config"))
}

/// Applet descriptor search path. Earlier directories take precedence.
fn applet_dirs_from(var: Option<&str>) -> Vec<PathBuf> {
    match var {
        Some(dirs) if !dirs.is_empty() => dirs.split(':').filter(|dir| !dir.is_empty()).map(PathBuf::from).collect(),
        _ => vec![PathBuf::from(DEFAULT_APPLETS_DIR)],
    }
}

impl std::fmt::Display for PanelPaths {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "applet-dirs: {}, ipc-socket: {}, layout-file: {}",
            itertools::join(self.applet_dirs.iter().map(|dir| dir.display()), ":"),
            self.ipc_socket_file.display(),
            self.layout_file.display()
        )
    }
}
