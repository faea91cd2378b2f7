//! Client side proxies of the applet protocol, used by the panel.
//!
//! Neither interface has a well-known location: factories live on
//! `org.cafe.panel.applet.<factory_id>` and applets wherever `GetApplet` says, so proxies are
//! always built with `builder(..).destination(..)?.path(..)?`.

use std::collections::HashMap;

use zbus::{
    dbus_proxy,
    zvariant::{OwnedObjectPath, Value},
};

#[dbus_proxy(interface = "org.cafe.panel.applet.AppletFactory")]
trait AppletFactory {
    /// GetApplet method
    fn get_applet(
        &self,
        applet_id: &str,
        screen: i32,
        props: &HashMap<&str, Value<'_>>,
    ) -> zbus::Result<(OwnedObjectPath, bool, u32, u32)>;

    /// DestroyApplet method
    fn destroy_applet(&self, uid: u32) -> zbus::Result<()>;
}

#[dbus_proxy(interface = "org.cafe.panel.applet.Applet")]
trait Applet {
    /// PopupMenu method
    fn popup_menu(&self, button: u32, time: u32) -> zbus::Result<()>;

    /// Move signal
    #[dbus_proxy(signal, name = "Move")]
    fn move_applet(&self) -> zbus::Result<()>;

    /// RemoveFromPanel signal
    #[dbus_proxy(signal)]
    fn remove_from_panel(&self) -> zbus::Result<()>;

    /// Lock signal
    #[dbus_proxy(signal)]
    fn lock(&self) -> zbus::Result<()>;

    /// Unlock signal
    #[dbus_proxy(signal)]
    fn unlock(&self) -> zbus::Result<()>;
}
