//! Panel-side façade of a hosted applet.

use std::sync::Arc;

use cafe_panel_applet::{AppletFlags, AppletProps, Background, ChildProperty, ChildValue, Orientation, Platform};
use tokio::task::JoinHandle;

use crate::{
    applets_manager::ActivationError,
    container::{AddedApplet, AppletContainer, ContainerEvent, ContainerEventSink, SocketFactory},
};

/// An outstanding request to put an applet on a toplevel. Consumed by the activation's outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameActivating {
    pub id: String,
    pub toplevel_id: String,
    pub position: i32,
    /// Keep the position even if the slot is taken.
    pub exactpos: bool,
    pub locked: bool,
}

#[derive(Debug)]
pub enum FrameEvent {
    Loaded(Result<AddedApplet, ActivationError>),
    Container(ContainerEvent),
}

pub type FrameEventSink = Arc<dyn Fn(FrameEvent) + Send + Sync>;

/// How a frame talks to its applet. Results and notifications arrive through the frame's
/// [`FrameEventSink`].
pub trait AppletFrameBackend: Send {
    /// Start loading `iid`. Finishes with [`FrameEvent::Loaded`].
    fn load(&mut self, iid: &str, props: AppletProps);
    /// Fetch the properties the panel lays the applet out by.
    fn init_properties(&self);
    fn sync_menu_state(&self, locked: bool, locked_down: bool);
    fn popup_menu(&self, button: u32, time: u32);
    fn change_orientation(&self, orientation: Orientation);
    fn change_size(&self, size: u32);
    fn change_background(&self, background: &Background);
    /// Drop the connection to the applet, cancelling everything in flight, and end the applet.
    fn stop(&mut self);
}

/// Frame backend for applets created through a D-Bus factory.
pub struct DBusFrameBackend {
    container: AppletContainer,
    connection: Option<zbus::Connection>,
    screen: i32,
    sink: FrameEventSink,
    load_task: Option<JoinHandle<()>>,
}

impl DBusFrameBackend {
    pub fn new(
        platform: Platform,
        connection: Option<zbus::Connection>,
        socket_factory: Option<Arc<dyn SocketFactory>>,
        screen: i32,
        sink: FrameEventSink,
    ) -> Self {
        let container_sink: ContainerEventSink = {
            let sink = sink.clone();
            Arc::new(move |event| sink(FrameEvent::Container(event)))
        };
        DBusFrameBackend {
            container: AppletContainer::new(platform, socket_factory, container_sink),
            connection,
            screen,
            sink,
            load_task: None,
        }
    }

    pub fn container(&self) -> &AppletContainer {
        &self.container
    }

    fn set(&self, prop: ChildProperty, value: ChildValue) {
        let name = prop.name();
        self.container.child_set(
            name,
            value,
            Some(Box::new(move |result| crate::print_result_err!(format!("setting applet property {}", name), result))),
        );
    }

    fn fetch(&self, prop: ChildProperty) {
        let sink = self.sink.clone();
        self.container.child_get(
            prop.name(),
            Some(Box::new(move |result| match result {
                Ok(value) => sink(FrameEvent::Container(ContainerEvent::ChildPropertyChanged(prop, value))),
                Err(e) => log::warn!("Failed to get applet property {}: {}", prop, e),
            })),
        );
    }
}

impl AppletFrameBackend for DBusFrameBackend {
    fn load(&mut self, iid: &str, props: AppletProps) {
        let Some(con) = self.connection.clone() else {
            (self.sink)(FrameEvent::Loaded(Err(ActivationError::NoSessionBus)));
            return;
        };
        let container = self.container.clone();
        let sink = self.sink.clone();
        let iid = iid.to_string();
        let screen = self.screen;
        self.load_task = Some(tokio::spawn(async move {
            let result = container.add(&con, &iid, &props, screen).await;
            sink(FrameEvent::Loaded(result.map_err(ActivationError::from)));
        }));
    }

    fn init_properties(&self) {
        self.fetch(ChildProperty::Flags);
        self.fetch(ChildProperty::SizeHints);
    }

    fn sync_menu_state(&self, locked: bool, locked_down: bool) {
        self.set(ChildProperty::Locked, ChildValue::Bool(locked));
        self.set(ChildProperty::LockedDown, ChildValue::Bool(locked_down));
    }

    fn popup_menu(&self, button: u32, time: u32) {
        self.container.child_popup_menu(
            button,
            time,
            Some(Box::new(|result| crate::print_result_err!("showing applet menu", result))),
        );
    }

    fn change_orientation(&self, orientation: Orientation) {
        self.set(ChildProperty::Orient, ChildValue::U32(orientation.as_u32()));
    }

    fn change_size(&self, size: u32) {
        self.set(ChildProperty::Size, ChildValue::U32(size));
    }

    fn change_background(&self, background: &Background) {
        self.set(ChildProperty::Background, ChildValue::Str(background.to_string()));
    }

    fn stop(&mut self) {
        if let Some(task) = self.load_task.take() {
            task.abort();
        }
        self.container.detach();
    }
}

impl Drop for DBusFrameBackend {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A live applet on a toplevel.
pub struct AppletFrame {
    pub id: String,
    pub iid: String,
    pub toplevel_id: String,
    pub position: i32,
    pub locked: bool,
    /// Distinguishes this activation's events from those of earlier frames with the same id.
    pub generation: u64,
    pub applet: AddedApplet,
    backend: Box<dyn AppletFrameBackend>,
    flags: AppletFlags,
    size_hints: Vec<i32>,
}

impl AppletFrame {
    pub fn new(activating: FrameActivating, iid: String, generation: u64, applet: AddedApplet, backend: Box<dyn AppletFrameBackend>) -> Self {
        AppletFrame {
            id: activating.id,
            iid,
            toplevel_id: activating.toplevel_id,
            position: activating.position,
            locked: activating.locked,
            generation,
            applet,
            backend,
            flags: AppletFlags::empty(),
            size_hints: Vec::new(),
        }
    }

    pub fn backend(&self) -> &dyn AppletFrameBackend {
        self.backend.as_ref()
    }

    /// The request that recreates this frame at the same place.
    pub fn reactivation(&self) -> FrameActivating {
        FrameActivating {
            id: self.id.clone(),
            toplevel_id: self.toplevel_id.clone(),
            position: self.position,
            exactpos: true,
            locked: self.locked,
        }
    }

    /// Returns whether the frame's layout needs to be updated.
    pub fn handle_property_changed(&mut self, prop: ChildProperty, value: &ChildValue) -> bool {
        match (prop, value) {
            (ChildProperty::Flags, ChildValue::U32(bits)) => {
                let flags = AppletFlags::from_bits_truncate(*bits);
                let changed = flags != self.flags;
                self.flags = flags;
                changed
            }
            (ChildProperty::SizeHints, ChildValue::IntArray(hints)) => {
                if hints.len() % 2 != 0 {
                    log::warn!("Ignoring odd size hints of {}", self.id);
                    return false;
                }
                let changed = *hints != self.size_hints;
                self.size_hints = hints.clone();
                changed
            }
            _ => false,
        }
    }

    pub fn expand_major(&self) -> bool {
        self.flags.contains(AppletFlags::EXPAND_MAJOR)
    }

    pub fn expand_minor(&self) -> bool {
        self.flags.contains(AppletFlags::EXPAND_MINOR)
    }

    pub fn has_handle(&self) -> bool {
        self.flags.contains(AppletFlags::HAS_HANDLE)
    }

    pub fn size_hints(&self) -> &[i32] {
        &self.size_hints
    }

    pub fn stop(&mut self) {
        self.backend.stop();
    }
}

impl std::fmt::Debug for AppletFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppletFrame")
            .field("id", &self.id)
            .field("iid", &self.iid)
            .field("toplevel_id", &self.toplevel_id)
            .field("position", &self.position)
            .field("locked", &self.locked)
            .field("applet", &self.applet)
            .finish_non_exhaustive()
    }
}
