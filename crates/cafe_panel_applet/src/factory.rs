use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};

use zbus::{
    fdo::{RequestNameFlags, RequestNameReply},
    zvariant::{OwnedObjectPath, OwnedValue},
};

use crate::{names, Applet, AppletInterface, AppletProps, Error, FactoryInterface, Plug, PlugProvider, Result};

pub type SetupFn = Arc<dyn Fn(&Applet, &str) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactoryPhase {
    Unactivated,
    Activating,
    Active,
    /// Only reached by out-of-process factories, once their last applet is gone.
    Terminated,
}

/// Reply of a successful `GetApplet` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedApplet {
    pub object_path: OwnedObjectPath,
    pub out_of_process: bool,
    pub xid: u32,
    pub uid: u32,
}

struct LiveApplet {
    applet: Applet,
    _plug: Option<Box<dyn Plug>>,
}

struct FactoryState {
    phase: FactoryPhase,
    next_uid: u32,
    applets: BTreeMap<u32, LiveApplet>,
    connection: Option<zbus::Connection>,
    plugs: Option<Arc<dyn PlugProvider>>,
}

struct FactoryInner {
    factory_id: String,
    out_of_process: bool,
    setup: SetupFn,
    state: Mutex<FactoryState>,
    shutdown: tokio::sync::Notify,
}

/// Serves `org.cafe.panel.applet.AppletFactory` for one factory id and owns the applets it created.
#[derive(Clone)]
pub struct AppletFactory {
    inner: Arc<FactoryInner>,
}

impl std::fmt::Debug for AppletFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppletFactory")
            .field("factory_id", &self.inner.factory_id)
            .field("out_of_process", &self.inner.out_of_process)
            .finish_non_exhaustive()
    }
}

impl AppletFactory {
    /// `setup` is called with every new applet and its applet id, and returns whether the applet
    /// could be filled in.
    pub fn new(factory_id: impl Into<String>, out_of_process: bool, setup: impl Fn(&Applet, &str) -> bool + Send + Sync + 'static) -> Self {
        AppletFactory {
            inner: Arc::new(FactoryInner {
                factory_id: factory_id.into(),
                out_of_process,
                setup: Arc::new(setup),
                state: Mutex::new(FactoryState {
                    phase: FactoryPhase::Unactivated,
                    next_uid: 0,
                    applets: BTreeMap::new(),
                    connection: None,
                    plugs: default_plug_provider(),
                }),
                shutdown: tokio::sync::Notify::new(),
            }),
        }
    }

    pub fn factory_id(&self) -> &str {
        &self.inner.factory_id
    }

    pub fn is_out_of_process(&self) -> bool {
        self.inner.out_of_process
    }

    pub fn phase(&self) -> FactoryPhase {
        self.lock_state().phase
    }

    pub fn n_applets(&self) -> usize {
        self.lock_state().applets.len()
    }

    pub fn applet(&self, uid: u32) -> Option<Applet> {
        self.lock_state().applets.get(&uid).map(|live| live.applet.clone())
    }

    /// Replace the plug provider. Without one, applets get no plug and an xid of 0.
    pub fn set_plug_provider(&self, plugs: Option<Arc<dyn PlugProvider>>) {
        self.lock_state().plugs = plugs;
    }

    /// Export the factory object and claim the factory's bus name.
    pub async fn activate(&self, con: &zbus::Connection) -> Result<()> {
        let path = names::factory_object_path(self.factory_id());
        let bus_name = names::factory_bus_name(self.factory_id());
        self.lock_state().phase = FactoryPhase::Activating;

        if !con.object_server().at(path.as_str(), FactoryInterface::new(self.clone())).await? {
            return Err(zbus::Error::Failure(format!("Object already exists at {} on this connection", path)).into());
        }

        let flags = [RequestNameFlags::DoNotQueue];
        match con.request_name_with_flags(bus_name.as_str(), flags.into_iter().collect()).await? {
            RequestNameReply::PrimaryOwner | RequestNameReply::AlreadyOwner => {}
            RequestNameReply::Exists | RequestNameReply::InQueue => {
                con.object_server().remove::<FactoryInterface, _>(path.as_str()).await?;
                self.lock_state().phase = FactoryPhase::Unactivated;
                return Err(Error::FactoryRunning(self.factory_id().to_string()));
            }
        }

        log::info!("Factory {} is serving on {}", self.factory_id(), bus_name);
        let mut state = self.lock_state();
        state.connection = Some(con.clone());
        state.phase = FactoryPhase::Active;
        Ok(())
    }

    /// Resolves once an out-of-process factory has lost its last applet.
    pub async fn wait_for_shutdown(&self) {
        self.inner.shutdown.notified().await
    }

    /// Activate on `con` and serve until the factory shuts down.
    pub async fn run(&self, con: &zbus::Connection) -> Result<()> {
        self.activate(con).await?;
        self.wait_for_shutdown().await;
        Ok(())
    }

    /// Destroy the applet with the given uid, as if its plug had gone away.
    pub fn destroy_applet(&self, uid: u32) -> Result<()> {
        let applet = self
            .applet(uid)
            .ok_or_else(|| Error::UnknownApplet { factory_id: self.factory_id().to_string(), uid })?;
        applet.destroy();
        Ok(())
    }

    /// Create a new applet instance and export it on `con`.
    pub async fn get_applet(
        &self,
        con: &zbus::Connection,
        applet_id: &str,
        screen: i32,
        props: &HashMap<String, OwnedValue>,
    ) -> Result<CreatedApplet> {
        let props = AppletProps::from_dict(props)?;
        let (applet, plug) = self.create_instance(applet_id, screen, &props)?;
        let uid = applet.uid();
        let object_path = OwnedObjectPath::try_from(names::applet_object_path(applet_id, uid)).map_err(zbus::Error::from)?;

        con.object_server().at(object_path.as_str(), AppletInterface::new(applet.clone())).await?;
        applet.bind(con.clone(), object_path.clone());

        let runtime = tokio::runtime::Handle::current();
        applet.on_destroy({
            let factory = self.clone();
            let con = con.clone();
            let object_path = object_path.clone();
            move |applet| factory.applet_destroyed(runtime, con, object_path, applet.uid())
        });

        let xid = plug.as_ref().map(|plug| plug.xid()).unwrap_or(0);
        let embedded = plug.is_some();
        self.lock_state().applets.insert(uid, LiveApplet { applet: applet.clone(), _plug: plug });
        if !embedded {
            run_setup(&self.inner.setup, &applet);
        }

        log::info!("Created applet {} with uid {} at {} (xid {})", applet_id, uid, object_path.as_str(), xid);
        Ok(CreatedApplet { object_path, out_of_process: self.is_out_of_process(), xid, uid })
    }

    /// Allocate a uid and build the applet and its plug. With a plug, setup waits for embedding.
    fn create_instance(&self, applet_id: &str, screen: i32, props: &AppletProps) -> Result<(Applet, Option<Box<dyn Plug>>)> {
        let (uid, plugs) = {
            let mut state = self.lock_state();
            let uid = state.next_uid;
            state.next_uid = uid.checked_add(1).ok_or_else(|| Error::UidsExhausted(self.factory_id().to_string()))?;
            (uid, state.plugs.clone())
        };

        let applet = Applet::new(applet_id, uid, self.is_out_of_process(), props);
        let plug = match plugs {
            Some(plugs) if self.is_out_of_process() => {
                let setup = self.inner.setup.clone();
                let for_setup = applet.clone();
                Some(plugs.create_plug(&applet, screen, Box::new(move || run_setup(&setup, &for_setup)))?)
            }
            _ => None,
        };
        Ok((applet, plug))
    }

    fn applet_destroyed(&self, runtime: tokio::runtime::Handle, con: zbus::Connection, path: OwnedObjectPath, uid: u32) {
        let (removed, now_idle) = {
            let mut state = self.lock_state();
            let removed = state.applets.remove(&uid);
            (removed, state.applets.is_empty())
        };
        // dropping the entry releases the plug, outside of the state lock
        drop(removed);

        let factory = self.clone();
        runtime.spawn(async move {
            match con.object_server().remove::<AppletInterface, _>(path.as_str()).await {
                Ok(_) => log::debug!("Unregistered applet {}", path.as_str()),
                Err(e) => log::error!("Failed to unregister applet {}: {}", path.as_str(), e),
            }
            if now_idle && factory.is_out_of_process() {
                if let Err(e) = factory.shut_down(&con).await {
                    log::error!("Failed to shut down factory {}: {}", factory.factory_id(), e);
                }
            }
        });
    }

    async fn shut_down(&self, con: &zbus::Connection) -> Result<()> {
        {
            let mut state = self.lock_state();
            if !state.applets.is_empty() || state.phase != FactoryPhase::Active {
                return Ok(());
            }
            state.phase = FactoryPhase::Terminated;
            state.connection = None;
        }
        log::info!("Factory {} has no applets left, shutting down", self.factory_id());
        con.object_server().remove::<FactoryInterface, _>(names::factory_object_path(self.factory_id()).as_str()).await?;
        con.release_name(names::factory_bus_name(self.factory_id()).as_str()).await?;
        self.inner.shutdown.notify_one();
        Ok(())
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, FactoryState> {
        self.inner.state.lock().unwrap() // unwrap: mutex poisoning is okay
    }
}

fn run_setup(setup: &SetupFn, applet: &Applet) {
    if !setup(applet, applet.id()) {
        log::error!("Setup of applet {} (uid {}) failed", applet.id(), applet.uid());
    }
}

#[cfg(feature = "x11")]
fn default_plug_provider() -> Option<Arc<dyn PlugProvider>> {
    crate::Platform::detect().is_x11().then(|| Arc::new(crate::X11PlugProvider) as Arc<dyn PlugProvider>)
}

#[cfg(not(feature = "x11"))]
fn default_plug_provider() -> Option<Arc<dyn PlugProvider>> {
    None
}

/// Run a factory on the session bus until it shuts down.
///
/// Out-of-process factories return once their last applet is destroyed, in-process ones never do.
pub async fn factory_main(
    factory_id: &str,
    out_of_process: bool,
    setup: impl Fn(&Applet, &str) -> bool + Send + Sync + 'static,
) -> Result<()> {
    let con = zbus::Connection::session().await?;
    AppletFactory::new(factory_id, out_of_process, setup).run(&con).await
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakePlug(u32);

    impl Plug for FakePlug {
        fn xid(&self) -> u32 {
            self.0
        }
    }

    /// Hands out plugs whose embedding is triggered by the test.
    #[derive(Default)]
    struct FakePlugs {
        pending: Mutex<Vec<crate::EmbeddedCallback>>,
    }

    impl PlugProvider for FakePlugs {
        fn create_plug(&self, applet: &Applet, _screen: i32, on_embedded: crate::EmbeddedCallback) -> Result<Box<dyn Plug>> {
            self.pending.lock().unwrap().push(on_embedded);
            Ok(Box::new(FakePlug(0x400000 + applet.uid())))
        }
    }

    fn counting_factory(out_of_process: bool) -> (AppletFactory, Arc<AtomicUsize>) {
        let setups = Arc::new(AtomicUsize::new(0));
        let factory = AppletFactory::new("ClockAppletFactory", out_of_process, {
            let setups = setups.clone();
            move |_, applet_id| {
                setups.fetch_add(1, Ordering::SeqCst);
                applet_id == "ClockApplet"
            }
        });
        factory.set_plug_provider(None);
        (factory, setups)
    }

    #[test]
    fn test_uids_strictly_increase() {
        let (factory, _) = counting_factory(true);
        let uids: Vec<u32> = (0..3)
            .map(|_| factory.create_instance("ClockApplet", 0, &AppletProps::default()).unwrap().0.uid())
            .collect();
        assert_eq!(uids, vec![0, 1, 2]);
    }

    #[test]
    fn test_uids_exhausted() {
        let (factory, _) = counting_factory(true);
        factory.lock_state().next_uid = u32::MAX;
        assert!(matches!(
            factory.create_instance("ClockApplet", 0, &AppletProps::default()),
            Err(Error::UidsExhausted(_))
        ));
    }

    #[test]
    fn test_setup_waits_for_embedding() {
        let (factory, setups) = counting_factory(true);
        let plugs = Arc::new(FakePlugs::default());
        factory.set_plug_provider(Some(plugs.clone()));

        let (applet, plug) = factory.create_instance("ClockApplet", 0, &AppletProps::default()).unwrap();
        assert_eq!(plug.map(|plug| plug.xid()), Some(0x400000 + applet.uid()));
        assert_eq!(setups.load(Ordering::SeqCst), 0);

        for embedded in plugs.pending.lock().unwrap().drain(..) {
            embedded();
        }
        assert_eq!(setups.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_in_process_factories_get_no_plug() {
        let (factory, _) = counting_factory(false);
        factory.set_plug_provider(Some(Arc::new(FakePlugs::default())));
        let (applet, plug) = factory.create_instance("ClockApplet", 0, &AppletProps::default()).unwrap();
        assert!(plug.is_none());
        assert!(!applet.is_out_of_process());
    }

    #[test]
    fn test_phase_starts_unactivated() {
        let (factory, _) = counting_factory(true);
        assert_eq!(factory.phase(), FactoryPhase::Unactivated);
        assert_eq!(factory.n_applets(), 0);
    }

    /// A peer-to-peer connection pair, with the factory served on the first one.
    async fn connect_peers() -> (zbus::Connection, zbus::Connection) {
        let (server, client) = tokio::net::UnixStream::pair().unwrap();
        let guid = zbus::Guid::generate();
        tokio::try_join!(
            zbus::ConnectionBuilder::unix_stream(server).server(&guid).p2p().build(),
            zbus::ConnectionBuilder::unix_stream(client).p2p().build(),
        )
        .unwrap()
    }

    async fn factory_proxy(client: &zbus::Connection) -> crate::proxy::AppletFactoryProxy<'static> {
        crate::proxy::AppletFactoryProxy::builder(client)
            .destination(names::factory_bus_name("ClockAppletFactory"))
            .unwrap()
            .path(names::factory_object_path("ClockAppletFactory"))
            .unwrap()
            .cache_properties(zbus::CacheProperties::No)
            .build()
            .await
            .unwrap()
    }

    async fn eventually(mut done: impl FnMut() -> bool) {
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while !done() {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap()
    }

    async fn has_applet_object(con: &zbus::Connection, path: &str) -> bool {
        con.object_server().interface::<_, AppletInterface>(path).await.is_ok()
    }

    /// Object removal runs on a spawned task, so give it a moment.
    async fn wait_for_removal(con: &zbus::Connection, path: &str) {
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while has_applet_object(con, path).await {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_get_applet_over_bus() {
        let (factory, setups) = counting_factory(true);
        let (server, client) = connect_peers().await;
        factory.activate(&server).await.unwrap();
        assert_eq!(factory.phase(), FactoryPhase::Active);

        let props = AppletProps { prefs_path: Some("/org/cafe/panel/objects/clock/prefs/".to_string()), ..Default::default() };
        let (path, out_of_process, xid, uid) =
            factory_proxy(&client).await.get_applet("ClockApplet", 0, &props.to_dict()).await.unwrap();
        assert_eq!(path.as_str(), "/org/cafe/panel/applet/ClockApplet/0");
        assert_eq!((out_of_process, xid, uid), (true, 0, 0));
        // no plug, so setup ran right away
        assert_eq!(setups.load(Ordering::SeqCst), 1);
        assert_eq!(factory.applet(0).unwrap().object_path(), Some(path.clone()));

        let properties = zbus::fdo::PropertiesProxy::builder(&client)
            .destination(names::factory_bus_name("ClockAppletFactory"))
            .unwrap()
            .path(path.clone())
            .unwrap()
            .cache_properties(zbus::CacheProperties::No)
            .build()
            .await
            .unwrap();
        let iface = zbus::names::InterfaceName::from_static_str_unchecked(names::APPLET_INTERFACE);
        let prefs_path = properties.get(iface.clone(), "PrefsPath").await.unwrap();
        assert_eq!(
            crate::ChildValue::from_value(&prefs_path),
            Some(crate::ChildValue::Str("/org/cafe/panel/objects/clock/prefs/".to_string()))
        );

        properties.set(iface.clone(), "Locked", &zbus::zvariant::Value::from(true)).await.unwrap();
        assert!(factory.applet(0).unwrap().locked());
        let locked = properties.get(iface, "Locked").await.unwrap();
        assert_eq!(crate::ChildValue::from_value(&locked), Some(crate::ChildValue::Bool(true)));
    }

    #[tokio::test]
    async fn test_bad_props_are_invalid_args() {
        let (factory, _) = counting_factory(true);
        let (server, client) = connect_peers().await;
        factory.activate(&server).await.unwrap();

        let mut props = HashMap::new();
        props.insert("size", zbus::zvariant::Value::from("big"));
        let result = factory_proxy(&client).await.get_applet("ClockApplet", 0, &props).await;
        assert!(matches!(result, Err(zbus::Error::MethodError(name, _, _)) if name.as_str() == "org.freedesktop.DBus.Error.InvalidArgs"));
        assert_eq!(factory.n_applets(), 0);
    }

    #[tokio::test]
    async fn test_destroying_last_applet_ends_factory() {
        let (factory, _) = counting_factory(true);
        let (server, client) = connect_peers().await;
        let serving = tokio::spawn({
            let factory = factory.clone();
            let server = server.clone();
            async move { factory.run(&server).await }
        });
        eventually(|| factory.phase() == FactoryPhase::Active).await;

        let proxy = factory_proxy(&client).await;
        let props = AppletProps::default().to_dict();
        let (first, ..) = proxy.get_applet("ClockApplet", 0, &props).await.unwrap();
        let (second, ..) = proxy.get_applet("ClockApplet", 0, &props).await.unwrap();
        assert_eq!(factory.n_applets(), 2);

        proxy.destroy_applet(0).await.unwrap();
        assert_eq!(factory.n_applets(), 1);
        assert!(factory.applet(0).is_none());
        wait_for_removal(&server, first.as_str()).await;
        assert!(has_applet_object(&server, second.as_str()).await);
        assert_eq!(factory.phase(), FactoryPhase::Active);
        assert!(!serving.is_finished());

        // unknown uids are refused, the factory keeps serving
        assert!(proxy.destroy_applet(0).await.is_err());

        proxy.destroy_applet(1).await.unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), serving).await.unwrap().unwrap().unwrap();
        assert_eq!(factory.phase(), FactoryPhase::Terminated);
        assert!(!has_applet_object(&server, second.as_str()).await);
        let factory_path = names::factory_object_path("ClockAppletFactory");
        assert!(server.object_server().interface::<_, FactoryInterface>(factory_path.as_str()).await.is_err());
        // the name was already given up
        assert!(!server.release_name(names::factory_bus_name("ClockAppletFactory").as_str()).await.unwrap());
    }

    #[tokio::test]
    async fn test_in_process_factory_outlives_its_applets() {
        let (factory, _) = counting_factory(false);
        let (server, client) = connect_peers().await;
        factory.activate(&server).await.unwrap();

        let proxy = factory_proxy(&client).await;
        let (path, out_of_process, ..) = proxy.get_applet("ClockApplet", 0, &AppletProps::default().to_dict()).await.unwrap();
        assert!(!out_of_process);
        proxy.destroy_applet(0).await.unwrap();
        assert_eq!(factory.n_applets(), 0);
        wait_for_removal(&server, path.as_str()).await;
        assert_eq!(factory.phase(), FactoryPhase::Active);
    }
}
