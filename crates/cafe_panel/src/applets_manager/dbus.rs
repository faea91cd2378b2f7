use std::{path::PathBuf, sync::Arc};

use cafe_panel_applet::{shlib::WidgetPtr, Platform};

use super::{ActivationError, AppletsManager};
use crate::{
    applet_info::{AppletInfo, Iid},
    applets_registry::{AppletsRegistry, DescriptorEvent},
    container::SocketFactory,
    frame::{AppletFrameBackend, DBusFrameBackend, FrameEventSink},
    module_loader::ModuleLoader,
};

/// Applets served by factories on the session bus, or by in-process modules speaking the same
/// protocol.
pub struct DBusAppletsManager {
    registry: AppletsRegistry,
    loader: Box<dyn ModuleLoader>,
    platform: Platform,
    connection: Option<zbus::Connection>,
    socket_factory: Option<Arc<dyn SocketFactory>>,
    screen: i32,
}

impl DBusAppletsManager {
    pub fn new(
        registry: AppletsRegistry,
        loader: Box<dyn ModuleLoader>,
        platform: Platform,
        connection: Option<zbus::Connection>,
        socket_factory: Option<Arc<dyn SocketFactory>>,
        screen: i32,
    ) -> Self {
        DBusAppletsManager { registry, loader, platform, connection, socket_factory, screen }
    }
}

impl AppletsManager for DBusAppletsManager {
    fn name(&self) -> &'static str {
        "dbus"
    }

    fn get_applets(&self) -> Vec<&AppletInfo> {
        self.registry.get_applets()
    }

    fn get_applet_info(&self, iid: &str) -> Option<&AppletInfo> {
        self.registry.get_applet_info(iid)
    }

    fn get_applet_info_from_old_id(&self, old_id: &str) -> Option<&AppletInfo> {
        self.registry.get_applet_info_from_old_id(old_id)
    }

    fn factory_activate(&mut self, iid: &str) -> Result<(), ActivationError> {
        let info = self.registry.get_applet_info(iid).ok_or_else(|| ActivationError::UnknownApplet(iid.to_string()))?;
        if !info.supports(self.platform) {
            return Err(ActivationError::UnsupportedPlatform { iid: iid.to_string(), platform: self.platform });
        }

        let (factory, runtime) = self.registry.factory_runtime(iid).ok_or_else(|| ActivationError::UnknownApplet(iid.to_string()))?;
        if !factory.in_process {
            // the bus starts out-of-process factories on demand
            return Ok(());
        }

        if let Some(module) = &runtime.module {
            if runtime.n_applets == 0 {
                module.activate()?;
            }
        } else {
            let location = factory.location.as_ref().ok_or_else(|| ActivationError::UnknownApplet(iid.to_string()))?;
            log::info!("Loading in-process factory {} from {}", factory.id, location.display());
            let module = self.loader.load(location)?;
            module.activate()?;
            runtime.module = Some(module);
        }
        runtime.n_applets += 1;
        Ok(())
    }

    fn factory_deactivate(&mut self, iid: &str) {
        if let Some((factory, runtime)) = self.registry.factory_runtime(iid) {
            if factory.in_process {
                runtime.n_applets = runtime.n_applets.saturating_sub(1);
            }
        }
    }

    fn load_applet(&self, iid: &str, sink: FrameEventSink) -> Result<Box<dyn AppletFrameBackend>, ActivationError> {
        if self.registry.get_applet_info(iid).is_none() {
            return Err(ActivationError::UnknownApplet(iid.to_string()));
        }
        Ok(Box::new(DBusFrameBackend::new(
            self.platform,
            self.connection.clone(),
            self.socket_factory.clone(),
            self.screen,
            sink,
        )))
    }

    fn get_applet_widget(&self, iid: &str, uid: u32) -> Option<WidgetPtr> {
        let factory_id = iid.parse::<Iid>().ok()?.factory_id;
        self.registry.module(iid)?.applet_widget(&factory_id, uid)
    }

    fn handle_descriptor_event(&mut self, event: &DescriptorEvent) -> bool {
        self.registry.handle_event(event)
    }

    fn watched_dirs(&self) -> Vec<PathBuf> {
        self.registry.dirs().to_vec()
    }
}
