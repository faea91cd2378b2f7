//! The persisted panel layout.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cafe_panel_applet::Orientation;
use serde::{Deserialize, Serialize};

fn default_size() -> u32 {
    24
}

fn default_background() -> String {
    "none".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToplevelConfig {
    pub id: String,
    #[serde(default)]
    pub orientation: Orientation,
    #[serde(default = "default_size")]
    pub size: u32,
    #[serde(default = "default_background")]
    pub background: String,
}

/// An applet placed on a toplevel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppletObject {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iid: Option<String>,
    /// Id from before applets had iids, resolved through the applets' old ids.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cafe_component_id: Option<String>,
    pub toplevel_id: String,
    #[serde(default)]
    pub position: i32,
    #[serde(default)]
    pub locked: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PanelLayout {
    pub locked_down: bool,
    pub toplevels: Vec<ToplevelConfig>,
    pub objects: Vec<AppletObject>,
}

/// The layout together with where it is stored. Changes are written back immediately.
#[derive(Debug)]
pub struct Profile {
    path: Option<PathBuf>,
    layout: PanelLayout,
    writable: bool,
}

impl Profile {
    /// Load the layout at `path`. A missing file is an empty layout.
    pub fn load(path: &Path) -> Result<Self> {
        let layout = match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).with_context(|| format!("Failed to parse layout {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("No layout at {}, starting with an empty panel", path.display());
                PanelLayout::default()
            }
            Err(e) => return Err(e).with_context(|| format!("Failed to read layout {}", path.display())),
        };
        let writable = std::fs::metadata(path).map(|metadata| !metadata.permissions().readonly()).unwrap_or(true);
        Ok(Profile { path: Some(path.to_path_buf()), layout, writable })
    }

    /// A layout that is never written anywhere.
    pub fn in_memory(layout: PanelLayout) -> Self {
        Profile { path: None, layout, writable: true }
    }

    pub fn layout(&self) -> &PanelLayout {
        &self.layout
    }

    pub fn is_locked_down(&self) -> bool {
        self.layout.locked_down
    }

    /// Whether applets may be added to or removed from the layout.
    pub fn id_lists_are_writable(&self) -> bool {
        self.writable
    }

    pub fn toplevel(&self, id: &str) -> Option<&ToplevelConfig> {
        self.layout.toplevels.iter().find(|toplevel| toplevel.id == id)
    }

    pub fn object(&self, id: &str) -> Option<&AppletObject> {
        self.layout.objects.iter().find(|object| object.id == id)
    }

    fn object_mut(&mut self, id: &str) -> Option<&mut AppletObject> {
        self.layout.objects.iter_mut().find(|object| object.id == id)
    }

    fn toplevel_mut(&mut self, id: &str) -> Result<&mut ToplevelConfig> {
        self.layout.toplevels.iter_mut().find(|toplevel| toplevel.id == id).with_context(|| format!("No toplevel {}", id))
    }

    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else { return Ok(()) };
        if !self.writable {
            log::debug!("Not saving read-only layout {}", path.display());
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let contents = serde_json::to_string_pretty(&self.layout)?;
        std::fs::write(path, contents).with_context(|| format!("Failed to write layout {}", path.display()))
    }

    /// Put a new applet on `toplevel_id`, returning its object id.
    pub fn add_object(&mut self, iid: &str, toplevel_id: &str, position: i32) -> Result<String> {
        if self.toplevel(toplevel_id).is_none() {
            anyhow::bail!("No toplevel {}", toplevel_id);
        }
        let id = (0..).map(|n| format!("object-{}", n)).find(|id| self.object(id).is_none()).context("Out of object ids")?;
        self.layout.objects.push(AppletObject {
            id: id.clone(),
            iid: Some(iid.to_string()),
            cafe_component_id: None,
            toplevel_id: toplevel_id.to_string(),
            position,
            locked: false,
        });
        self.save()?;
        Ok(id)
    }

    pub fn delete_object(&mut self, id: &str) -> Result<bool> {
        let before = self.layout.objects.len();
        self.layout.objects.retain(|object| object.id != id);
        let deleted = self.layout.objects.len() != before;
        if deleted {
            self.save()?;
        }
        Ok(deleted)
    }

    pub fn set_locked(&mut self, id: &str, locked: bool) -> Result<()> {
        let object = self.object_mut(id).with_context(|| format!("No applet object {}", id))?;
        if object.locked != locked {
            object.locked = locked;
            self.save()?;
        }
        Ok(())
    }

    /// Record the iid a legacy object resolved to.
    pub fn migrate_object_iid(&mut self, id: &str, iid: &str) -> Result<()> {
        let object = self.object_mut(id).with_context(|| format!("No applet object {}", id))?;
        object.iid = Some(iid.to_string());
        object.cafe_component_id = None;
        self.save()
    }

    pub fn set_locked_down(&mut self, locked_down: bool) -> Result<()> {
        self.layout.locked_down = locked_down;
        self.save()
    }

    pub fn set_orientation(&mut self, toplevel_id: &str, orientation: Orientation) -> Result<()> {
        self.toplevel_mut(toplevel_id)?.orientation = orientation;
        self.save()
    }

    pub fn set_size(&mut self, toplevel_id: &str, size: u32) -> Result<()> {
        self.toplevel_mut(toplevel_id)?.size = size;
        self.save()
    }

    pub fn set_background(&mut self, toplevel_id: &str, background: &str) -> Result<()> {
        self.toplevel_mut(toplevel_id)?.background = background.to_string();
        self.save()
    }
}
