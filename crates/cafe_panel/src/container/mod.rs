//! The panel side of the applet protocol: activates a factory, requests an applet from it,
//! embeds the applet's plug and relays property reads and writes.

use std::sync::{Arc, Mutex, Weak};

use cafe_panel_applet::{
    names::{self, APPLET_INTERFACE},
    proxy::{AppletFactoryProxy, AppletProxy},
    AppletProps, ChildProperty, ChildValue, Platform,
};
use futures::StreamExt;
use tokio::task::JoinHandle;
use zbus::{
    fdo::{DBusProxy, NameOwnerChanged, PropertiesChanged, PropertiesProxy},
    names::{BusName, WellKnownName},
    CacheProperties, MatchRule, Message, MessageStream, MessageType,
};

use crate::applet_info::Iid;

mod channel;
mod pending_ops;
mod socket;

pub use channel::*;
pub use pending_ops::*;
pub use socket::*;

#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("Invalid child property {0:?}")]
    InvalidChildProperty(String),
    #[error("Invalid value for child property {property}, expected {expected}")]
    InvalidChildValue { property: ChildProperty, expected: &'static str },
    #[error("Operation was cancelled")]
    Cancelled,
    #[error("Not connected to an applet")]
    NotConnected,
    #[error("Invalid applet iid {0:?}")]
    InvalidIid(String),
    #[error("Out-of-process applets can only be embedded on X11")]
    OutOfProcessUnsupported,
    #[error(transparent)]
    DBus(#[from] zbus::Error),
    #[error(transparent)]
    Fdo(#[from] zbus::fdo::Error),
    #[error(transparent)]
    Socket(#[from] SocketError),
}

/// Notifications about the contained applet.
#[derive(Debug, Clone, PartialEq)]
pub enum ContainerEvent {
    /// The applet went away without being asked to.
    Broken,
    Move,
    Remove,
    Lock(bool),
    ChildPropertyChanged(ChildProperty, ChildValue),
}

pub type ContainerEventSink = Arc<dyn Fn(ContainerEvent) + Send + Sync>;

/// Where an applet ended up after [`AppletContainer::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddedApplet {
    pub out_of_process: bool,
    pub xid: u32,
    pub uid: u32,
}

#[derive(Clone)]
pub struct AppletContainer {
    inner: Arc<ContainerInner>,
}

struct ContainerInner {
    platform: Platform,
    socket_factory: Option<Arc<dyn SocketFactory>>,
    events: ContainerEventSink,
    pending_ops: PendingOperations,
    state: Mutex<ContainerState>,
}

#[derive(Default)]
struct ContainerState {
    iid: Option<String>,
    channel: Option<Arc<dyn AppletChannel>>,
    applet: Option<AddedApplet>,
    socket: Option<Box<dyn EmbedSocket>>,
    watch_tasks: Vec<JoinHandle<()>>,
    remote: Option<RemoteApplet>,
    broken: bool,
}

/// The factory-side instance behind an attached applet.
struct RemoteApplet {
    factory: AppletFactoryProxy<'static>,
    uid: u32,
}

impl RemoteApplet {
    async fn destroy(self) {
        match self.factory.destroy_applet(self.uid).await {
            Ok(()) => log::debug!("Factory {} destroyed applet {}", self.factory.destination(), self.uid),
            Err(e) => log::debug!("Factory {} did not destroy applet {}: {}", self.factory.destination(), self.uid, e),
        }
    }
}

/// Signal subscriptions for an applet, opened before the applet exists so nothing it emits
/// during setup is missed.
struct AppletSubscriptions {
    signals: MessageStream,
    property_changes: MessageStream,
    owner_changes: MessageStream,
}

impl AppletSubscriptions {
    async fn open(con: &zbus::Connection, owner: &str, bus_name: &str) -> Result<Self, ContainerError> {
        let signals = MatchRule::builder().msg_type(MessageType::Signal).sender(owner)?.interface(APPLET_INTERFACE)?.build();
        let property_changes = MatchRule::builder()
            .msg_type(MessageType::Signal)
            .sender(owner)?
            .interface("org.freedesktop.DBus.Properties")?
            .member("PropertiesChanged")?
            .build();
        let owner_changes = MatchRule::builder()
            .msg_type(MessageType::Signal)
            .sender("org.freedesktop.DBus")?
            .interface("org.freedesktop.DBus")?
            .member("NameOwnerChanged")?
            .add_arg(bus_name)?
            .build();
        Ok(AppletSubscriptions {
            signals: MessageStream::for_match_rule(signals, con, None).await?,
            property_changes: MessageStream::for_match_rule(property_changes, con, None).await?,
            owner_changes: MessageStream::for_match_rule(owner_changes, con, None).await?,
        })
    }

    /// Forward everything concerning the applet at `object_path` to the container's events.
    fn watch(self, container: &Arc<ContainerInner>, object_path: String) -> Vec<JoinHandle<()>> {
        let AppletSubscriptions { mut signals, mut property_changes, mut owner_changes } = self;
        let weak = Arc::downgrade(container);

        let signal_task = {
            let weak = weak.clone();
            let object_path = object_path.clone();
            tokio::spawn(async move {
                while let Some(msg) = signals.next().await {
                    let Ok(msg) = msg else { continue };
                    if !is_from_object(&msg, &object_path) {
                        continue;
                    }
                    let member = msg.member();
                    let event = match member.as_ref().map(|member| member.as_str()) {
                        Some("Move") => ContainerEvent::Move,
                        Some("RemoveFromPanel") => ContainerEvent::Remove,
                        Some("Lock") => ContainerEvent::Lock(true),
                        Some("Unlock") => ContainerEvent::Lock(false),
                        _ => continue,
                    };
                    let Some(inner) = weak.upgrade() else { break };
                    (inner.events)(event);
                }
            })
        };

        let property_task = {
            let weak = weak.clone();
            tokio::spawn(async move {
                while let Some(msg) = property_changes.next().await {
                    let Ok(msg) = msg else { continue };
                    if !is_from_object(&msg, &object_path) {
                        continue;
                    }
                    let Some(signal) = PropertiesChanged::from_message(msg) else { continue };
                    let Ok(args) = signal.args() else { continue };
                    if args.interface_name().as_str() != APPLET_INTERFACE {
                        continue;
                    }
                    let Some(inner) = weak.upgrade() else { break };
                    for (name, value) in args.changed_properties() {
                        let prop = ChildProperty::from_dbus_name(name);
                        match prop.zip(ChildValue::from_value(value)) {
                            Some((prop, value)) if prop.accepts(&value) => {
                                (inner.events)(ContainerEvent::ChildPropertyChanged(prop, value))
                            }
                            _ => log::debug!("Ignoring change of applet property {}", name),
                        }
                    }
                }
            })
        };

        let owner_task = tokio::spawn(async move {
            while let Some(msg) = owner_changes.next().await {
                let Ok(msg) = msg else { continue };
                let Some(signal) = NameOwnerChanged::from_message(msg) else { continue };
                let Ok(args) = signal.args() else { continue };
                if args.new_owner().is_none() {
                    log::info!("{} left the bus", args.name());
                    plug_removed(&weak);
                    break;
                }
            }
        });

        vec![signal_task, property_task, owner_task]
    }
}

fn is_from_object(msg: &Message, object_path: &str) -> bool {
    msg.path().is_some_and(|path| path.as_str() == object_path)
}

/// Proxies to the applet object at `object_path`.
async fn applet_channel(con: &zbus::Connection, owner: &str, object_path: &str) -> Result<DBusAppletChannel, ContainerError> {
    let properties = PropertiesProxy::builder(con)
        .destination(owner.to_string())?
        .path(object_path.to_string())?
        .cache_properties(CacheProperties::No)
        .build()
        .await?;
    let applet = AppletProxy::builder(con)
        .destination(owner.to_string())?
        .path(object_path.to_string())?
        .cache_properties(CacheProperties::No)
        .build()
        .await?;
    Ok(DBusAppletChannel::new(properties, applet))
}

impl AppletContainer {
    pub fn new(platform: Platform, socket_factory: Option<Arc<dyn SocketFactory>>, events: ContainerEventSink) -> Self {
        AppletContainer {
            inner: Arc::new(ContainerInner {
                platform,
                socket_factory,
                events,
                pending_ops: PendingOperations::default(),
                state: Mutex::new(ContainerState::default()),
            }),
        }
    }

    pub fn iid(&self) -> Option<String> {
        self.state().iid.clone()
    }

    pub fn applet(&self) -> Option<AddedApplet> {
        self.state().applet
    }

    pub fn is_connected(&self) -> bool {
        self.state().channel.is_some()
    }

    pub fn pending_operations(&self) -> &PendingOperations {
        &self.inner.pending_ops
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ContainerState> {
        self.inner.state.lock().unwrap() // unwrap: mutex poisoning is okay
    }

    /// Ask the factory of `iid` for a new applet and embed it.
    ///
    /// The factory is started through bus activation if nobody owns its name yet.
    pub async fn add(&self, con: &zbus::Connection, iid: &str, props: &AppletProps, screen: i32) -> Result<AddedApplet, ContainerError> {
        let parsed: Iid = iid.parse().map_err(|_| ContainerError::InvalidIid(iid.to_string()))?;
        self.state().iid = Some(iid.to_string());

        let bus_name = names::factory_bus_name(&parsed.factory_id);
        let owner = activate_bus_name(con, &bus_name).await?;
        log::debug!("Factory {} is owned by {}", bus_name, owner);
        self.request_applet(con, &parsed, &owner, &bus_name, props, screen).await
    }

    /// Call `GetApplet` on the factory owned by `owner` and attach to the applet it creates.
    ///
    /// If the applet cannot be attached, the factory is told to destroy it again.
    async fn request_applet(
        &self,
        con: &zbus::Connection,
        iid: &Iid,
        owner: &str,
        bus_name: &str,
        props: &AppletProps,
        screen: i32,
    ) -> Result<AddedApplet, ContainerError> {
        let subscriptions = AppletSubscriptions::open(con, owner, bus_name).await?;

        let factory = AppletFactoryProxy::builder(con)
            .destination(owner.to_string())?
            .path(names::factory_object_path(&iid.factory_id))?
            .cache_properties(CacheProperties::No)
            .build()
            .await?;
        let (object_path, out_of_process, xid, uid) = factory.get_applet(&iid.applet_id, screen, &props.to_dict()).await?;
        let object_path = object_path.as_str().to_string();
        log::debug!("Got applet {} at {} (out of process: {}, xid: {}, uid: {})", iid, object_path, out_of_process, xid, uid);
        let remote = RemoteApplet { factory, uid };

        let attached = match applet_channel(con, owner, &object_path).await {
            Ok(channel) => self.attach(Arc::new(channel), out_of_process, xid, uid),
            Err(e) => Err(e),
        };
        match attached {
            Ok(applet) => {
                let watch_tasks = subscriptions.watch(&self.inner, object_path);
                let mut state = self.state();
                if state.broken {
                    watch_tasks.iter().for_each(JoinHandle::abort);
                } else {
                    state.watch_tasks.extend(watch_tasks);
                    state.remote = Some(remote);
                }
                Ok(applet)
            }
            Err(e) => {
                remote.destroy().await;
                Err(e)
            }
        }
    }

    /// Connect to an applet the factory handed out.
    pub fn attach(&self, channel: Arc<dyn AppletChannel>, out_of_process: bool, xid: u32, uid: u32) -> Result<AddedApplet, ContainerError> {
        let socket = if out_of_process {
            if !self.inner.platform.is_x11() {
                log::warn!("Cannot embed out-of-process applet {} on {}", self.iid().unwrap_or_default(), self.inner.platform);
                return Err(ContainerError::OutOfProcessUnsupported);
            }
            let socket_factory = self.inner.socket_factory.as_ref().ok_or(ContainerError::OutOfProcessUnsupported)?;
            let weak = Arc::downgrade(&self.inner);
            let mut socket = socket_factory.create_socket(Box::new(move || plug_removed(&weak)))?;
            if xid != 0 {
                socket.add_id(xid)?;
            } else {
                log::debug!("Applet {} has no plug to embed yet", uid);
            }
            Some(socket)
        } else {
            None
        };

        let applet = AddedApplet { out_of_process, xid, uid };
        let mut state = self.state();
        state.channel = Some(channel);
        state.applet = Some(applet);
        state.socket = socket;
        state.broken = false;
        Ok(applet)
    }

    /// Read a property of the applet.
    pub fn child_get(&self, name: &str, callback: Option<OperationCallback<ChildValue>>) -> OperationId {
        let prop = match name.parse::<ChildProperty>() {
            Ok(prop) => prop,
            Err(_) => return self.inner.pending_ops.fail(ContainerError::InvalidChildProperty(name.to_string()), callback),
        };
        match self.channel() {
            Some(channel) => self.inner.pending_ops.spawn(channel.get_property(prop), callback),
            None => self.inner.pending_ops.fail(ContainerError::NotConnected, callback),
        }
    }

    /// Write a property of the applet. Every call is sent on its own.
    pub fn child_set(&self, name: &str, value: ChildValue, callback: Option<OperationCallback<()>>) -> OperationId {
        let prop = match name.parse::<ChildProperty>() {
            Ok(prop) => prop,
            Err(_) => return self.inner.pending_ops.fail(ContainerError::InvalidChildProperty(name.to_string()), callback),
        };
        if !prop.accepts(&value) {
            let error = ContainerError::InvalidChildValue { property: prop, expected: prop.type_name() };
            return self.inner.pending_ops.fail(error, callback);
        }
        match self.channel() {
            Some(channel) => self.inner.pending_ops.spawn(channel.set_property(prop, value), callback),
            None => self.inner.pending_ops.fail(ContainerError::NotConnected, callback),
        }
    }

    pub fn child_popup_menu(&self, button: u32, time: u32, callback: Option<OperationCallback<()>>) -> OperationId {
        match self.channel() {
            Some(channel) => self.inner.pending_ops.spawn(channel.popup_menu(button, time), callback),
            None => self.inner.pending_ops.fail(ContainerError::NotConnected, callback),
        }
    }

    pub fn cancel_operation(&self, id: OperationId) -> bool {
        self.inner.pending_ops.cancel(id)
    }

    pub fn cancel_pending_operations(&self) {
        self.inner.pending_ops.cancel_all();
    }

    fn channel(&self) -> Option<Arc<dyn AppletChannel>> {
        self.state().channel.clone()
    }

    /// The applet's plug went away. Tears the connection down and reports the applet as broken, once.
    pub fn plug_removed(&self) {
        let (socket, watch_tasks) = {
            let mut state = self.state();
            if state.broken {
                return;
            }
            state.broken = true;
            state.channel = None;
            // whatever ended the plug also ended the applet
            state.remote = None;
            (state.socket.take(), std::mem::take(&mut state.watch_tasks))
        };
        let iid = self.iid().unwrap_or_default();
        match &socket {
            Some(socket) => match socket.plug_xid() {
                Some(xid) => log::info!("Applet {} is gone, its plug {} left socket {}", iid, xid, socket.id()),
                None => log::info!("Applet {} is gone, socket {} never got a plug", iid, socket.id()),
            },
            None => log::info!("Applet {} is gone", iid),
        }
        self.inner.pending_ops.cancel_all();
        for task in watch_tasks {
            task.abort();
        }
        drop(socket);
        (self.inner.events)(ContainerEvent::Broken);
    }

    /// Drop the connection to the applet and have its factory destroy it.
    pub fn detach(&self) {
        let (socket, watch_tasks, remote) = {
            let mut state = self.state();
            state.channel = None;
            state.applet = None;
            (state.socket.take(), std::mem::take(&mut state.watch_tasks), state.remote.take())
        };
        self.inner.pending_ops.cancel_all();
        for task in watch_tasks {
            task.abort();
        }
        drop(socket);

        let Some(remote) = remote else { return };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(remote.destroy());
            }
            Err(_) => log::warn!("Cannot destroy applet {} without a runtime", remote.uid),
        }
    }
}

fn plug_removed(inner: &Weak<ContainerInner>) {
    if let Some(inner) = inner.upgrade() {
        AppletContainer { inner }.plug_removed();
    }
}

impl Drop for ContainerInner {
    fn drop(&mut self) {
        self.pending_ops.cancel_all();
        if let Ok(state) = self.state.get_mut() {
            for task in state.watch_tasks.drain(..) {
                task.abort();
            }
        }
    }
}

/// Make sure `bus_name` has an owner, starting its service if needed, and return the owner.
async fn activate_bus_name(con: &zbus::Connection, bus_name: &str) -> Result<String, ContainerError> {
    let dbus = DBusProxy::new(con).await?;
    let name = BusName::try_from(bus_name).map_err(zbus::Error::from)?;
    if !dbus.name_has_owner(name.clone()).await? {
        log::debug!("Starting {}", bus_name);
        let well_known = WellKnownName::try_from(bus_name).map_err(zbus::Error::from)?;
        dbus.start_service_by_name(well_known, 0).await?;
    }
    Ok(dbus.get_name_owner(name).await?.to_string())
}

#[cfg(test)]
mod test {
    use super::*;
    use futures::future::BoxFuture;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct FakeChannel {
        calls: Mutex<Vec<String>>,
        hang: bool,
    }

    impl FakeChannel {
        fn hanging() -> Self {
            FakeChannel { hang: true, ..Default::default() }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn respond<T: Send + 'static>(&self, call: String, value: T) -> BoxFuture<'static, Result<T, ContainerError>> {
            self.calls.lock().unwrap().push(call);
            if self.hang {
                Box::pin(futures::future::pending())
            } else {
                Box::pin(async move { Ok(value) })
            }
        }
    }

    impl AppletChannel for FakeChannel {
        fn get_property(&self, prop: ChildProperty) -> BoxFuture<'static, Result<ChildValue, ContainerError>> {
            self.respond(format!("get {}", prop), ChildValue::U32(1))
        }

        fn set_property(&self, prop: ChildProperty, value: ChildValue) -> BoxFuture<'static, Result<(), ContainerError>> {
            self.respond(format!("set {} {:?}", prop, value), ())
        }

        fn popup_menu(&self, button: u32, time: u32) -> BoxFuture<'static, Result<(), ContainerError>> {
            self.respond(format!("popup {} {}", button, time), ())
        }
    }

    #[derive(Default)]
    struct FakeSockets {
        log: Arc<Mutex<Vec<String>>>,
        on_removed: Mutex<Option<PlugRemovedCallback>>,
    }

    struct FakeSocket(Arc<Mutex<Vec<String>>>, Option<u32>);

    impl EmbedSocket for FakeSocket {
        fn id(&self) -> u32 {
            42
        }

        fn add_id(&mut self, xid: u32) -> Result<(), SocketError> {
            self.0.lock().unwrap().push(format!("add_id {}", xid));
            self.1 = Some(xid);
            Ok(())
        }

        fn plug_xid(&self) -> Option<u32> {
            self.1
        }
    }

    impl SocketFactory for FakeSockets {
        fn create_socket(&self, on_plug_removed: PlugRemovedCallback) -> Result<Box<dyn EmbedSocket>, SocketError> {
            self.log.lock().unwrap().push("create_socket".to_string());
            *self.on_removed.lock().unwrap() = Some(on_plug_removed);
            Ok(Box::new(FakeSocket(self.log.clone(), None)))
        }
    }

    fn new_container(platform: Platform, sockets: Option<Arc<FakeSockets>>) -> (AppletContainer, mpsc::UnboundedReceiver<ContainerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink: ContainerEventSink = Arc::new(move |event| {
            let _ = tx.send(event);
        });
        let sockets = sockets.map(|sockets| sockets as Arc<dyn SocketFactory>);
        (AppletContainer::new(platform, sockets, sink), rx)
    }

    fn reporting<T: Send + 'static>(tx: &mpsc::UnboundedSender<Result<T, ContainerError>>) -> Option<OperationCallback<T>> {
        let tx = tx.clone();
        Some(Box::new(move |result| {
            let _ = tx.send(result);
        }))
    }

    #[tokio::test]
    async fn test_unknown_property_fails_without_bus_traffic() {
        let (container, _events) = new_container(Platform::X11, None);
        let channel = Arc::new(FakeChannel::default());
        container.attach(channel.clone(), false, 0, 0).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        container.child_get("frobnicate", reporting(&tx));
        assert!(matches!(rx.recv().await.unwrap(), Err(ContainerError::InvalidChildProperty(name)) if name == "frobnicate"));
        assert!(channel.calls().is_empty());
    }

    #[tokio::test]
    async fn test_wrong_value_type_is_rejected() {
        let (container, _events) = new_container(Platform::X11, None);
        let channel = Arc::new(FakeChannel::default());
        container.attach(channel.clone(), false, 0, 0).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        container.child_set("size", ChildValue::Str("big".to_string()), reporting(&tx));
        assert!(matches!(
            rx.recv().await.unwrap(),
            Err(ContainerError::InvalidChildValue { property: ChildProperty::Size, .. })
        ));
        assert!(channel.calls().is_empty());
    }

    #[tokio::test]
    async fn test_not_connected() {
        let (container, _events) = new_container(Platform::X11, None);
        let (tx, mut rx) = mpsc::unbounded_channel();
        container.child_popup_menu(3, 0, reporting(&tx));
        assert!(matches!(rx.recv().await.unwrap(), Err(ContainerError::NotConnected)));
    }

    #[tokio::test]
    async fn test_identical_sets_are_independent_calls() {
        let (container, _events) = new_container(Platform::X11, None);
        let channel = Arc::new(FakeChannel::hanging());
        container.attach(channel.clone(), false, 0, 0).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let first = container.child_set("size", ChildValue::U32(48), reporting(&tx));
        let second = container.child_set("size", ChildValue::U32(48), reporting(&tx));
        assert_ne!(first, second);
        assert_eq!(channel.calls(), vec!["set size U32(48)".to_string(), "set size U32(48)".to_string()]);
        assert_eq!(container.pending_operations().len(), 2);

        assert!(container.cancel_operation(first));
        assert!(matches!(rx.recv().await.unwrap(), Err(ContainerError::Cancelled)));
        assert_eq!(container.pending_operations().len(), 1);

        assert!(container.cancel_operation(second));
        assert!(matches!(rx.recv().await.unwrap(), Err(ContainerError::Cancelled)));
        assert!(container.pending_operations().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_sweep() {
        let (container, _events) = new_container(Platform::X11, None);
        container.attach(Arc::new(FakeChannel::hanging()), false, 0, 0).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let get_tx = tx.clone();
        container.child_get("flags", Some(Box::new(move |result: Result<ChildValue, ContainerError>| {
            let _ = get_tx.send(result.map(|_| ()));
        })));
        container.child_set("orient", ChildValue::U32(2), reporting(&tx));
        container.child_popup_menu(3, 0, reporting(&tx));
        container.cancel_pending_operations();
        assert!(container.pending_operations().is_empty());

        for _ in 0..3 {
            let result = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
            assert!(matches!(result, Err(ContainerError::Cancelled)));
        }
        assert!(tokio::time::timeout(Duration::from_millis(50), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_child_get_reads_through_channel() {
        let (container, _events) = new_container(Platform::X11, None);
        let channel = Arc::new(FakeChannel::default());
        container.attach(channel.clone(), false, 0, 5).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        container.child_get("flags", reporting(&tx));
        assert_eq!(rx.recv().await.unwrap().unwrap(), ChildValue::U32(1));
        assert_eq!(channel.calls(), vec!["get flags".to_string()]);
    }

    #[tokio::test]
    async fn test_zero_xid_creates_socket_without_plug() {
        let sockets = Arc::new(FakeSockets::default());
        let (container, _events) = new_container(Platform::X11, Some(sockets.clone()));
        let added = container.attach(Arc::new(FakeChannel::default()), true, 0, 1).unwrap();
        assert_eq!(added, AddedApplet { out_of_process: true, xid: 0, uid: 1 });
        assert_eq!(*sockets.log.lock().unwrap(), vec!["create_socket".to_string()]);

        let (other, _events) = new_container(Platform::X11, Some(sockets.clone()));
        other.attach(Arc::new(FakeChannel::default()), true, 0x2a00003, 2).unwrap();
        assert_eq!(*sockets.log.lock().unwrap(), vec![
            "create_socket".to_string(),
            "create_socket".to_string(),
            format!("add_id {}", 0x2a00003)
        ]);
    }

    #[tokio::test]
    async fn test_out_of_process_refused_on_wayland() {
        let sockets = Arc::new(FakeSockets::default());
        let (container, _events) = new_container(Platform::Wayland, Some(sockets.clone()));
        let result = container.attach(Arc::new(FakeChannel::default()), true, 0x2a00003, 1);
        assert!(matches!(result, Err(ContainerError::OutOfProcessUnsupported)));
        assert!(sockets.log.lock().unwrap().is_empty());
        assert!(!container.is_connected());

        // in-process applets need no socket
        let added = container.attach(Arc::new(FakeChannel::default()), false, 0, 4).unwrap();
        assert_eq!(added.uid, 4);
    }

    #[tokio::test]
    async fn test_plug_removal_breaks_once() {
        let sockets = Arc::new(FakeSockets::default());
        let (container, mut events) = new_container(Platform::X11, Some(sockets.clone()));
        container.attach(Arc::new(FakeChannel::hanging()), true, 7, 1).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        container.child_get("size", reporting(&tx));

        let on_removed = sockets.on_removed.lock().unwrap().take().unwrap();
        on_removed();
        container.plug_removed();

        assert_eq!(events.recv().await.unwrap(), ContainerEvent::Broken);
        assert!(events.try_recv().is_err());
        assert!(matches!(rx.recv().await.unwrap(), Err(ContainerError::Cancelled)));
        assert!(!container.is_connected());
    }

    const CLOCK_FACTORY: &str = "org.cafe.panel.applet.ClockAppletFactory";
    const CLOCK_PREFS: &str = "/org/cafe/panel/objects/clock/prefs/";

    fn clock_factory() -> cafe_panel_applet::AppletFactory {
        let factory = cafe_panel_applet::AppletFactory::new("ClockAppletFactory", true, |_, _| true);
        factory.set_plug_provider(None);
        factory
    }

    /// Serve `factory` on one end of a peer-to-peer connection, returning both ends.
    async fn serve_factory(factory: &cafe_panel_applet::AppletFactory) -> (zbus::Connection, zbus::Connection) {
        let (server, client) = tokio::net::UnixStream::pair().unwrap();
        let guid = zbus::Guid::generate();
        let server = zbus::ConnectionBuilder::unix_stream(server)
            .server(&guid)
            .p2p()
            .serve_at(names::factory_object_path(factory.factory_id()), cafe_panel_applet::FactoryInterface::new(factory.clone()))
            .unwrap();
        tokio::try_join!(server.build(), zbus::ConnectionBuilder::unix_stream(client).p2p().build()).unwrap()
    }

    async fn request_clock(container: &AppletContainer, client: &zbus::Connection) -> Result<AddedApplet, ContainerError> {
        let iid: Iid = "ClockAppletFactory::ClockApplet".parse().unwrap();
        container.state().iid = Some(iid.to_string());
        let props = AppletProps { prefs_path: Some(CLOCK_PREFS.to_string()), ..Default::default() };
        container.request_applet(client, &iid, CLOCK_FACTORY, CLOCK_FACTORY, &props, 0).await
    }

    /// The next event that is not a property change.
    async fn next_signal(events: &mut mpsc::UnboundedReceiver<ContainerEvent>) -> ContainerEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await.unwrap() {
                    ContainerEvent::ChildPropertyChanged(..) => continue,
                    event => return event,
                }
            }
        })
        .await
        .unwrap()
    }

    async fn has_applet_object(con: &zbus::Connection, path: &str) -> bool {
        con.object_server().interface::<_, cafe_panel_applet::AppletInterface>(path).await.is_ok()
    }

    #[tokio::test]
    async fn test_add_over_bus() {
        let factory = clock_factory();
        let (server, client) = serve_factory(&factory).await;
        let sockets = Arc::new(FakeSockets::default());
        let (container, mut events) = new_container(Platform::X11, Some(sockets.clone()));

        let added = request_clock(&container, &client).await.unwrap();
        assert_eq!(added, AddedApplet { out_of_process: true, xid: 0, uid: 0 });
        assert_eq!(*sockets.log.lock().unwrap(), vec!["create_socket".to_string()]);
        assert_eq!(container.state().watch_tasks.len(), 3);
        let applet = factory.applet(0).unwrap();
        assert_eq!(applet.prefs_path(), CLOCK_PREFS);

        let (tx, mut rx) = mpsc::unbounded_channel();
        container.child_get("prefs-path", reporting(&tx));
        assert_eq!(rx.recv().await.unwrap().unwrap(), ChildValue::Str(CLOCK_PREFS.to_string()));

        let (tx, mut rx) = mpsc::unbounded_channel();
        container.child_set("locked", ChildValue::Bool(true), reporting(&tx));
        rx.recv().await.unwrap().unwrap();
        assert!(applet.locked());
        assert_eq!(next_signal(&mut events).await, ContainerEvent::Lock(true));

        applet.request_move();
        assert_eq!(next_signal(&mut events).await, ContainerEvent::Move);
        applet.request_remove();
        assert_eq!(next_signal(&mut events).await, ContainerEvent::Remove);

        let path = names::applet_object_path("ClockApplet", 0);
        assert!(has_applet_object(&server, &path).await);
        container.detach();
        assert!(!container.is_connected());
        assert!(container.state().watch_tasks.is_empty());

        tokio::time::timeout(Duration::from_secs(5), async {
            while factory.n_applets() > 0 || has_applet_object(&server, &path).await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(applet.is_destroyed());
    }

    #[tokio::test]
    async fn test_failed_attach_destroys_applet() {
        let factory = clock_factory();
        let (_server, client) = serve_factory(&factory).await;
        let sockets = Arc::new(FakeSockets::default());
        let (container, mut events) = new_container(Platform::Wayland, Some(sockets.clone()));

        let result = request_clock(&container, &client).await;
        assert!(matches!(result, Err(ContainerError::OutOfProcessUnsupported)));
        assert!(container.state().watch_tasks.is_empty());
        assert!(container.state().remote.is_none());
        assert!(!container.is_connected());
        // the destroy call is answered before the error is returned
        assert_eq!(factory.n_applets(), 0);
        assert!(tokio::time::timeout(Duration::from_millis(50), events.recv()).await.is_err());
    }
}
