use std::collections::HashMap;

use zbus::{
    dbus_interface, fdo,
    zvariant::{OwnedObjectPath, OwnedValue},
    SignalContext,
};

use crate::{AppletFactory, AppletFlags, Error, Orientation, SizeHints};

/// Implementation of `org.cafe.panel.applet.Applet` for a single applet instance.
///
/// Properties are writable by the panel. Invalid writes are logged and leave the applet unchanged.
pub struct AppletInterface {
    applet: crate::Applet,
}

impl AppletInterface {
    pub fn new(applet: crate::Applet) -> Self {
        AppletInterface { applet }
    }
}

#[dbus_interface(name = "org.cafe.panel.applet.Applet")]
impl AppletInterface {
    /// PopupMenu method
    fn popup_menu(&self, button: u32, time: u32) {
        self.applet.popup_menu(button, time);
    }

    /// Move signal
    #[dbus_interface(signal, name = "Move")]
    pub async fn move_applet(ctxt: &SignalContext<'_>) -> zbus::Result<()>;

    /// RemoveFromPanel signal
    #[dbus_interface(signal)]
    pub async fn remove_from_panel(ctxt: &SignalContext<'_>) -> zbus::Result<()>;

    /// Lock signal
    #[dbus_interface(signal)]
    pub async fn lock(ctxt: &SignalContext<'_>) -> zbus::Result<()>;

    /// Unlock signal
    #[dbus_interface(signal)]
    pub async fn unlock(ctxt: &SignalContext<'_>) -> zbus::Result<()>;

    // ------------------------------------------------------------------------

    #[dbus_interface(property)]
    fn prefs_path(&self) -> String {
        self.applet.prefs_path()
    }

    #[dbus_interface(property)]
    fn set_prefs_path(&mut self, path: String) {
        self.applet.apply_prefs_path(path);
    }

    #[dbus_interface(property)]
    fn orient(&self) -> u32 {
        self.applet.orient().as_u32()
    }

    #[dbus_interface(property)]
    fn set_orient(&mut self, orient: u32) {
        match Orientation::from_u32(orient) {
            Ok(orient) => self.applet.apply_orient(orient),
            Err(e) => log::warn!("Ignoring orientation for {}: {}", self.applet.id(), e),
        }
    }

    #[dbus_interface(property)]
    fn size(&self) -> u32 {
        self.applet.size()
    }

    #[dbus_interface(property)]
    fn set_size(&mut self, size: u32) {
        self.applet.apply_size(size);
    }

    #[dbus_interface(property)]
    fn background(&self) -> String {
        self.applet.background_descriptor()
    }

    #[dbus_interface(property)]
    fn set_background(&mut self, background: String) {
        self.applet.apply_background(background);
    }

    #[dbus_interface(property)]
    pub fn flags(&self) -> u32 {
        self.applet.flags().bits()
    }

    #[dbus_interface(property)]
    fn set_flags(&mut self, flags: u32) {
        self.applet.apply_flags(AppletFlags::from_bits_truncate(flags));
    }

    #[dbus_interface(property)]
    pub fn size_hints(&self) -> Vec<i32> {
        self.applet.size_hints().into()
    }

    #[dbus_interface(property)]
    fn set_size_hints(&mut self, hints: Vec<i32>) {
        match SizeHints::new(hints) {
            Ok(hints) => self.applet.apply_size_hints(hints),
            Err(e) => log::warn!("Ignoring size hints for {}: {}", self.applet.id(), e),
        }
    }

    #[dbus_interface(property)]
    fn locked(&self) -> bool {
        self.applet.locked()
    }

    #[dbus_interface(property)]
    fn set_locked(&mut self, locked: bool) {
        self.applet.apply_locked(locked);
    }

    #[dbus_interface(property)]
    fn locked_down(&self) -> bool {
        self.applet.locked_down()
    }

    #[dbus_interface(property)]
    fn set_locked_down(&mut self, locked_down: bool) {
        self.applet.apply_locked_down(locked_down);
    }
}

/// Implementation of `org.cafe.panel.applet.AppletFactory`.
pub struct FactoryInterface {
    factory: AppletFactory,
}

impl FactoryInterface {
    pub fn new(factory: AppletFactory) -> Self {
        FactoryInterface { factory }
    }
}

#[dbus_interface(name = "org.cafe.panel.applet.AppletFactory")]
impl FactoryInterface {
    /// GetApplet method
    async fn get_applet(
        &self,
        applet_id: &str,
        screen: i32,
        props: HashMap<String, OwnedValue>,
        #[zbus(connection)] con: &zbus::Connection,
    ) -> fdo::Result<(OwnedObjectPath, bool, u32, u32)> {
        let created = self.factory.get_applet(con, applet_id, screen, &props).await.map_err(|e| match e {
            Error::UnknownProperty(_) | Error::PropertyType { .. } | Error::InvalidOrientation(_) | Error::OddSizeHints(_) => {
                fdo::Error::InvalidArgs(e.to_string())
            }
            e => fdo::Error::Failed(e.to_string()),
        })?;
        Ok((created.object_path, created.out_of_process, created.xid, created.uid))
    }

    /// DestroyApplet method
    ///
    /// Lets the panel end applets that have no plug whose destruction would do it.
    fn destroy_applet(&self, uid: u32) -> fdo::Result<()> {
        self.factory.destroy_applet(uid).map_err(|e| match e {
            Error::UnknownApplet { .. } => fdo::Error::InvalidArgs(e.to_string()),
            e => fdo::Error::Failed(e.to_string()),
        })
    }
}
