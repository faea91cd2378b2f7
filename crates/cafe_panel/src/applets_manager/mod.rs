//! Backends that know how to find, start and host applets.

use std::path::PathBuf;

use cafe_panel_applet::{shlib::WidgetPtr, Platform};

use crate::{
    applet_info::AppletInfo,
    applets_registry::DescriptorEvent,
    container::ContainerError,
    frame::{AppletFrameBackend, FrameEventSink},
    module_loader::ModuleError,
};

mod dbus;

pub use dbus::DBusAppletsManager;

#[derive(Debug, thiserror::Error)]
pub enum ActivationError {
    #[error("Unknown applet {0}")]
    UnknownApplet(String),
    #[error("Applet {iid} does not support {platform}")]
    UnsupportedPlatform { iid: String, platform: Platform },
    #[error("No applets manager handles {0}")]
    NoManager(String),
    #[error("Not connected to the session bus")]
    NoSessionBus,
    #[error(transparent)]
    Module(#[from] ModuleError),
    #[error(transparent)]
    Container(#[from] ContainerError),
}

pub trait AppletsManager {
    fn name(&self) -> &'static str;

    /// Whether this backend knows `iid`.
    fn handles(&self, iid: &str) -> bool {
        self.get_applet_info(iid).is_some()
    }

    fn get_applets(&self) -> Vec<&AppletInfo>;
    fn get_applet_info(&self, iid: &str) -> Option<&AppletInfo>;
    fn get_applet_info_from_old_id(&self, old_id: &str) -> Option<&AppletInfo>;

    /// Make sure the factory of `iid` is ready to create an applet.
    fn factory_activate(&mut self, iid: &str) -> Result<(), ActivationError>;
    /// Balance a [`factory_activate`](AppletsManager::factory_activate) whose applet went away.
    fn factory_deactivate(&mut self, iid: &str);

    /// Create the backend a frame loads `iid` with.
    fn load_applet(&self, iid: &str, sink: FrameEventSink) -> Result<Box<dyn AppletFrameBackend>, ActivationError>;
    fn get_applet_widget(&self, iid: &str, uid: u32) -> Option<WidgetPtr>;

    fn handle_descriptor_event(&mut self, event: &DescriptorEvent) -> bool;
    fn watched_dirs(&self) -> Vec<PathBuf>;
}

/// The available backends, in order of preference.
pub struct AppletsManagers {
    managers: Vec<Box<dyn AppletsManager>>,
}

impl AppletsManagers {
    pub fn new(managers: Vec<Box<dyn AppletsManager>>) -> Self {
        AppletsManagers { managers }
    }

    fn for_iid(&self, iid: &str) -> Option<&dyn AppletsManager> {
        self.managers.iter().find(|manager| manager.handles(iid)).map(|manager| manager.as_ref())
    }

    fn for_iid_mut(&mut self, iid: &str) -> Option<&mut Box<dyn AppletsManager>> {
        self.managers.iter_mut().find(|manager| manager.handles(iid))
    }

    pub fn get_applets(&self) -> Vec<&AppletInfo> {
        self.managers.iter().flat_map(|manager| manager.get_applets()).collect()
    }

    pub fn get_applet_info(&self, iid: &str) -> Option<&AppletInfo> {
        self.for_iid(iid)?.get_applet_info(iid)
    }

    pub fn get_applet_info_from_old_id(&self, old_id: &str) -> Option<&AppletInfo> {
        self.managers.iter().find_map(|manager| manager.get_applet_info_from_old_id(old_id))
    }

    pub fn factory_activate(&mut self, iid: &str) -> Result<(), ActivationError> {
        let manager = self.for_iid_mut(iid).ok_or_else(|| ActivationError::NoManager(iid.to_string()))?;
        log::debug!("Activating factory of {} through the {} manager", iid, manager.name());
        manager.factory_activate(iid)
    }

    pub fn factory_deactivate(&mut self, iid: &str) {
        match self.for_iid_mut(iid) {
            Some(manager) => manager.factory_deactivate(iid),
            None => log::debug!("No applets manager to deactivate {}", iid),
        }
    }

    pub fn load_applet(&self, iid: &str, sink: FrameEventSink) -> Result<Box<dyn AppletFrameBackend>, ActivationError> {
        self.for_iid(iid).ok_or_else(|| ActivationError::NoManager(iid.to_string()))?.load_applet(iid, sink)
    }

    pub fn get_applet_widget(&self, iid: &str, uid: u32) -> Option<WidgetPtr> {
        self.for_iid(iid)?.get_applet_widget(iid, uid)
    }

    pub fn handle_descriptor_event(&mut self, event: &DescriptorEvent) -> bool {
        self.managers.iter_mut().fold(false, |changed, manager| manager.handle_descriptor_event(event) || changed)
    }

    pub fn watched_dirs(&self) -> Vec<PathBuf> {
        self.managers.iter().flat_map(|manager| manager.watched_dirs()).collect()
    }
}
