use std::sync::{Arc, Mutex};

use zbus::{zvariant::OwnedObjectPath, SignalContext};

use crate::{
    shlib::WidgetPtr, AppletFlags, AppletInterface, AppletMenu, AppletProps, Background, ChildProperty, LogMenuPresenter,
    MenuAction, MenuPresenter, Orientation, Result, SizeHints, LOCK_ACTION, MOVE_ACTION, REMOVE_ACTION,
};

const DEFAULT_SIZE: u32 = 24;

/// Local notifications about changes the panel made to an applet.
#[derive(Debug, Clone, PartialEq)]
pub enum AppletEvent {
    ChangeOrient(Orientation),
    ChangeSize(u32),
    ChangeBackground(Background),
}

pub type AppletHandler = Arc<dyn Fn(&Applet, &AppletEvent) + Send + Sync>;
type DestroyObserver = Box<dyn FnOnce(&Applet) + Send>;

/// Current values of everything the panel can see of an applet.
#[derive(Debug, Clone, PartialEq)]
pub struct AppletState {
    pub prefs_path: String,
    pub orient: Orientation,
    pub size: u32,
    pub size_hints: SizeHints,
    pub background_descriptor: String,
    pub background: Background,
    pub flags: AppletFlags,
    pub locked: bool,
    pub locked_down: bool,
}

impl Default for AppletState {
    fn default() -> Self {
        AppletState {
            prefs_path: String::new(),
            orient: Orientation::default(),
            size: DEFAULT_SIZE,
            size_hints: SizeHints::default(),
            background_descriptor: "none".to_string(),
            background: Background::None,
            flags: AppletFlags::empty(),
            locked: false,
            locked_down: false,
        }
    }
}

impl AppletState {
    fn from_props(props: &AppletProps) -> Self {
        let mut state = AppletState::default();
        if let Some(path) = &props.prefs_path {
            state.prefs_path = path.clone();
        }
        if let Some(orient) = props.orient {
            state.orient = orient;
        }
        if let Some(size) = props.size {
            state.size = size;
        }
        if let Some(hints) = &props.size_hints {
            state.size_hints = hints.clone();
        }
        if let Some(descriptor) = &props.background {
            state.background = Background::decode_lossy(descriptor);
            state.background_descriptor = descriptor.clone();
        }
        if let Some(flags) = props.flags {
            state.flags = flags;
        }
        state.locked = props.locked.unwrap_or_default();
        state.locked_down = props.locked_down.unwrap_or_default();
        state
    }
}

#[derive(Debug, Clone, Copy)]
enum BusSignal {
    Move,
    RemoveFromPanel,
    Lock,
    Unlock,
}

#[derive(Clone)]
struct BusBinding {
    connection: zbus::Connection,
    path: OwnedObjectPath,
    runtime: tokio::runtime::Handle,
}

struct AppletInner {
    id: String,
    uid: u32,
    out_of_process: bool,
    state: Mutex<AppletState>,
    handlers: Mutex<Vec<AppletHandler>>,
    menu: Mutex<AppletMenu>,
    presenter: Mutex<Arc<dyn MenuPresenter>>,
    binding: Mutex<Option<BusBinding>>,
    destroy_observers: Mutex<Option<Vec<DestroyObserver>>>,
    widget: Mutex<Option<WidgetPtr>>,
}

/// A live applet instance, as seen by the applet author.
///
/// This is a cheap handle; clones refer to the same applet.
#[derive(Clone)]
pub struct Applet {
    inner: Arc<AppletInner>,
}

impl std::fmt::Debug for Applet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Applet").field("id", &self.inner.id).field("uid", &self.inner.uid).finish_non_exhaustive()
    }
}

impl Applet {
    pub fn new(id: impl Into<String>, uid: u32, out_of_process: bool, props: &AppletProps) -> Self {
        Applet {
            inner: Arc::new(AppletInner {
                id: id.into(),
                uid,
                out_of_process,
                state: Mutex::new(AppletState::from_props(props)),
                handlers: Mutex::new(Vec::new()),
                menu: Mutex::new(AppletMenu::default()),
                presenter: Mutex::new(Arc::new(LogMenuPresenter)),
                binding: Mutex::new(None),
                destroy_observers: Mutex::new(Some(Vec::new())),
                widget: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn uid(&self) -> u32 {
        self.inner.uid
    }

    pub fn is_out_of_process(&self) -> bool {
        self.inner.out_of_process
    }

    pub fn state(&self) -> AppletState {
        self.lock_state().clone()
    }

    pub fn prefs_path(&self) -> String {
        self.lock_state().prefs_path.clone()
    }

    pub fn orient(&self) -> Orientation {
        self.lock_state().orient
    }

    pub fn size(&self) -> u32 {
        self.lock_state().size
    }

    pub fn size_hints(&self) -> SizeHints {
        self.lock_state().size_hints.clone()
    }

    pub fn background(&self) -> Background {
        self.lock_state().background
    }

    pub fn background_descriptor(&self) -> String {
        self.lock_state().background_descriptor.clone()
    }

    pub fn flags(&self) -> AppletFlags {
        self.lock_state().flags
    }

    pub fn locked(&self) -> bool {
        self.lock_state().locked
    }

    pub fn locked_down(&self) -> bool {
        self.lock_state().locked_down
    }

    pub fn object_path(&self) -> Option<OwnedObjectPath> {
        self.binding().map(|binding| binding.path)
    }

    /// Register a handler for [`AppletEvent`]s.
    pub fn connect(&self, handler: impl Fn(&Applet, &AppletEvent) + Send + Sync + 'static) {
        self.inner.handlers.lock().unwrap().push(Arc::new(handler)); // unwrap: mutex poisoning is okay
    }

    /// Run `observer` when the applet is destroyed. Runs immediately if it already was.
    pub fn on_destroy(&self, observer: impl FnOnce(&Applet) + Send + 'static) {
        let mut observers = self.inner.destroy_observers.lock().unwrap(); // unwrap: mutex poisoning is okay
        if let Some(observers) = observers.as_mut() {
            observers.push(Box::new(observer));
            return;
        }
        drop(observers);
        observer(self);
    }

    /// Tear the applet down. Destroy observers run exactly once, however often this is called.
    pub fn destroy(&self) {
        let observers = self.inner.destroy_observers.lock().unwrap().take(); // unwrap: mutex poisoning is okay
        if let Some(observers) = observers {
            log::debug!("Destroying applet {} (uid {})", self.id(), self.uid());
            for observer in observers {
                observer(self);
            }
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroy_observers.lock().unwrap().is_none() // unwrap: mutex poisoning is okay
    }

    pub fn set_widget(&self, widget: WidgetPtr) {
        *self.inner.widget.lock().unwrap() = Some(widget); // unwrap: mutex poisoning is okay
    }

    pub fn widget(&self) -> Option<WidgetPtr> {
        *self.inner.widget.lock().unwrap() // unwrap: mutex poisoning is okay
    }

    // ------------------------------------------------------------------------
    // changes made by the panel

    pub(crate) fn apply_prefs_path(&self, path: String) {
        self.lock_state().prefs_path = path;
    }

    pub(crate) fn apply_orient(&self, orient: Orientation) {
        if self.update_state(|state| std::mem::replace(&mut state.orient, orient) != orient) {
            self.emit_event(AppletEvent::ChangeOrient(orient));
        }
    }

    pub(crate) fn apply_size(&self, size: u32) {
        if self.update_state(|state| std::mem::replace(&mut state.size, size) != size) {
            self.emit_event(AppletEvent::ChangeSize(size));
        }
    }

    pub(crate) fn apply_background(&self, descriptor: String) {
        let background = Background::decode_lossy(&descriptor);
        let changed = self.update_state(|state| {
            state.background_descriptor = descriptor;
            std::mem::replace(&mut state.background, background) != background
        });
        if changed {
            self.emit_event(AppletEvent::ChangeBackground(background));
        }
    }

    pub(crate) fn apply_flags(&self, flags: AppletFlags) {
        self.lock_state().flags = flags;
    }

    pub(crate) fn apply_size_hints(&self, hints: SizeHints) {
        self.lock_state().size_hints = hints;
    }

    /// Changing the lock state tells the panel through `Lock`/`Unlock` so it can persist it.
    pub(crate) fn apply_locked(&self, locked: bool) {
        if self.update_state(|state| std::mem::replace(&mut state.locked, locked) != locked) {
            self.emit_signal(if locked { BusSignal::Lock } else { BusSignal::Unlock });
        }
    }

    pub(crate) fn apply_locked_down(&self, locked_down: bool) {
        self.lock_state().locked_down = locked_down;
    }

    // ------------------------------------------------------------------------
    // author side

    pub fn set_flags(&self, flags: AppletFlags) {
        if self.update_state(|state| std::mem::replace(&mut state.flags, flags) != flags) {
            self.notify_property(ChildProperty::Flags);
        }
    }

    /// Set the size hints, adding `base_size` to every element.
    pub fn set_size_hints(&self, hints: &[i32], base_size: i32) -> Result<()> {
        let hints = SizeHints::with_base_size(hints, base_size)?;
        if self.update_state(|state| std::mem::replace(&mut state.size_hints, hints.clone()) != hints) {
            self.notify_property(ChildProperty::SizeHints);
        }
        Ok(())
    }

    /// Ask the panel to start dragging this applet.
    pub fn request_move(&self) {
        self.emit_signal(BusSignal::Move);
    }

    /// Ask the panel to remove this applet.
    pub fn request_remove(&self) {
        self.emit_signal(BusSignal::RemoveFromPanel);
    }

    pub fn toggle_locked(&self) {
        let locked = self.locked();
        self.apply_locked(!locked);
    }

    pub fn setup_menu(&self, actions: Vec<MenuAction>) {
        self.inner.menu.lock().unwrap().set_actions(actions); // unwrap: mutex poisoning is okay
    }

    pub fn set_menu_presenter(&self, presenter: impl MenuPresenter + 'static) {
        *self.inner.presenter.lock().unwrap() = Arc::new(presenter); // unwrap: mutex poisoning is okay
    }

    pub fn popup_menu(&self, button: u32, time: u32) {
        let (locked, locked_down) = {
            let state = self.lock_state();
            (state.locked, state.locked_down)
        };
        let items = self.inner.menu.lock().unwrap().items(locked, locked_down); // unwrap: mutex poisoning is okay
        let presenter = self.inner.presenter.lock().unwrap().clone(); // unwrap: mutex poisoning is okay
        presenter.popup(self, &items, button, time);
    }

    /// Run a menu action by name. Returns false if it is unknown or currently unavailable.
    pub fn activate_action(&self, name: &str) -> bool {
        let (locked, locked_down) = {
            let state = self.lock_state();
            (state.locked, state.locked_down)
        };
        let menu = self.inner.menu.lock().unwrap().clone(); // unwrap: mutex poisoning is okay
        let Some(item) = menu.items(locked, locked_down).into_iter().find(|item| item.action == name) else {
            log::warn!("Applet {} has no menu action {:?}", self.id(), name);
            return false;
        };
        if !item.visible || !item.sensitive {
            log::debug!("Ignoring unavailable menu action {:?} of {}", name, self.id());
            return false;
        }

        match name {
            REMOVE_ACTION => self.request_remove(),
            MOVE_ACTION => self.request_move(),
            LOCK_ACTION => self.toggle_locked(),
            _ => match menu.action(name) {
                Some(action) => (action.callback)(self),
                None => return false,
            },
        }
        true
    }

    // ------------------------------------------------------------------------

    pub(crate) fn bind(&self, connection: zbus::Connection, path: OwnedObjectPath) {
        let runtime = tokio::runtime::Handle::current();
        *self.inner.binding.lock().unwrap() = Some(BusBinding { connection, path, runtime }); // unwrap: mutex poisoning is okay
    }

    fn binding(&self) -> Option<BusBinding> {
        self.inner.binding.lock().unwrap().clone() // unwrap: mutex poisoning is okay
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, AppletState> {
        self.inner.state.lock().unwrap() // unwrap: mutex poisoning is okay
    }

    fn update_state(&self, f: impl FnOnce(&mut AppletState) -> bool) -> bool {
        f(&mut self.lock_state())
    }

    fn emit_event(&self, event: AppletEvent) {
        let handlers = self.inner.handlers.lock().unwrap().clone(); // unwrap: mutex poisoning is okay
        for handler in handlers {
            handler(self, &event);
        }
    }

    fn emit_signal(&self, signal: BusSignal) {
        let Some(binding) = self.binding() else {
            log::debug!("Applet {} is not on the bus, dropping {:?}", self.id(), signal);
            return;
        };
        binding.runtime.clone().spawn(async move {
            let result: zbus::Result<()> = async {
                let ctxt = SignalContext::new(&binding.connection, binding.path.as_str())?;
                match signal {
                    BusSignal::Move => AppletInterface::move_applet(&ctxt).await,
                    BusSignal::RemoveFromPanel => AppletInterface::remove_from_panel(&ctxt).await,
                    BusSignal::Lock => AppletInterface::lock(&ctxt).await,
                    BusSignal::Unlock => AppletInterface::unlock(&ctxt).await,
                }
            }
            .await;
            if let Err(e) = result {
                log::error!("Failed to emit {:?} for {}: {}", signal, binding.path.as_str(), e);
            }
        });
    }

    fn notify_property(&self, prop: ChildProperty) {
        let Some(binding) = self.binding() else {
            return;
        };
        binding.runtime.clone().spawn(async move {
            let result: zbus::Result<()> = async {
                let iface_ref =
                    binding.connection.object_server().interface::<_, AppletInterface>(binding.path.as_str()).await?;
                let iface = iface_ref.get().await;
                match prop {
                    ChildProperty::Flags => iface.flags_changed(iface_ref.signal_context()).await,
                    ChildProperty::SizeHints => iface.size_hints_changed(iface_ref.signal_context()).await,
                    _ => Ok(()),
                }
            }
            .await;
            if let Err(e) = result {
                log::error!("Failed to announce {} change for {}: {}", prop, binding.path.as_str(), e);
            }
        });
    }
}
