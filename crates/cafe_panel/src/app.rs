use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};

use anyhow::{Context, Result};
use cafe_panel_applet::{AppletProps, Background, Orientation};
use itertools::Itertools;
use tokio::sync::mpsc::UnboundedSender;

use crate::{
    applet_info::AppletInfo,
    applets_manager::{ActivationError, AppletsManagers},
    applets_registry::DescriptorEvent,
    container::{AddedApplet, ContainerEvent},
    dialogs::{BrokenApplet, BrokenResponse, LoadFailedResponse, LoadFailure, PanelShell},
    frame::{AppletFrame, AppletFrameBackend, FrameActivating, FrameEvent, FrameEventSink},
    load_queue::{LoadQueue, QueuedLoad},
    profile::{AppletObject, Profile},
    response::{DaemonResponse, Responder},
    shutdown::ShutdownReason,
};

#[derive(Debug)]
pub enum PanelCommand {
    NoOp,
    /// Load every applet of the layout.
    LoadInitialApplets,
    AddApplet {
        iid: String,
        toplevel_id: String,
        position: i32,
        sender: Responder,
    },
    ReloadApplet {
        id: String,
        sender: Responder,
    },
    PopupMenu {
        id: String,
        button: u32,
        time: u32,
        sender: Responder,
    },
    SetOrientation {
        toplevel_id: String,
        orientation: Orientation,
        sender: Responder,
    },
    SetSize {
        toplevel_id: String,
        size: u32,
        sender: Responder,
    },
    SetBackground {
        toplevel_id: String,
        background: String,
        sender: Responder,
    },
    SetLockedDown {
        locked_down: bool,
        sender: Responder,
    },
    ListApplets(Responder),
    /// Something happened to the frame `id` created by activation number `generation`.
    Frame {
        id: String,
        generation: u64,
        event: FrameEvent,
    },
    DescriptorChanged(DescriptorEvent),
    /// Show the toplevels even if applets are still loading.
    RevealTimeout,
    KillServer,
}

/// Where a request to load an applet came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadOrigin {
    Configuration,
    User,
}

/// An applet whose container is still being set up.
struct PendingActivation {
    activating: FrameActivating,
    iid: String,
    generation: u64,
    backend: Box<dyn AppletFrameBackend>,
}

pub struct App {
    pub managers: AppletsManagers,
    pub profile: Profile,
    pub shell: Box<dyn PanelShell>,
    pub load_queue: LoadQueue,
    pub applets: BTreeMap<String, AppletFrame>,
    activating: HashMap<String, PendingActivation>,
    /// Applets that failed to load or were told not to come back. Only an explicit request
    /// from the user loads them again.
    pub no_reload: HashSet<String>,
    next_generation: u64,

    pub app_evt_send: UnboundedSender<PanelCommand>,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("profile", &self.profile)
            .field("load_queue", &self.load_queue)
            .field("applets", &self.applets)
            .field("activating", &self.activating.keys().collect::<Vec<_>>())
            .field("no_reload", &self.no_reload)
            .finish()
    }
}

impl App {
    pub fn new(
        managers: AppletsManagers,
        profile: Profile,
        shell: Box<dyn PanelShell>,
        app_evt_send: UnboundedSender<PanelCommand>,
    ) -> Self {
        App {
            managers,
            profile,
            shell,
            load_queue: LoadQueue::default(),
            applets: BTreeMap::new(),
            activating: HashMap::new(),
            no_reload: HashSet::new(),
            next_generation: 0,
            app_evt_send,
        }
    }

    /// Handle a PanelCommand event.
    pub fn handle_command(&mut self, event: PanelCommand) {
        log::debug!("Handling event: {:?}", &event);
        let result = self.try_handle_command(event);
        if let Err(err) = result {
            log::error!("{:?}", err);
        }
    }

    fn try_handle_command(&mut self, event: PanelCommand) -> Result<()> {
        match event {
            PanelCommand::NoOp => {}
            PanelCommand::LoadInitialApplets => self.load_initial_applets(),
            PanelCommand::AddApplet { iid, toplevel_id, position, sender } => {
                let result = self.add_applet(iid, &toplevel_id, position);
                sender.respond(result);
            }
            PanelCommand::ReloadApplet { id, sender } => {
                let result = self.reload_applet(&id).map(|iid| format!("Reloading {} ({})", id, iid));
                sender.respond(result);
            }
            PanelCommand::PopupMenu { id, button, time, sender } => {
                let result = self.applet(&id).map(|frame| {
                    frame.backend().popup_menu(button, time);
                    format!("Showing the menu of {}", id)
                });
                sender.respond(result);
            }
            PanelCommand::SetOrientation { toplevel_id, orientation, sender } => {
                let result = self.profile.set_orientation(&toplevel_id, orientation).map(|()| {
                    self.applets_on(&toplevel_id).for_each(|frame| frame.backend().change_orientation(orientation));
                    orientation
                });
                sender.respond(result);
            }
            PanelCommand::SetSize { toplevel_id, size, sender } => {
                let result = self.profile.set_size(&toplevel_id, size).map(|()| {
                    self.applets_on(&toplevel_id).for_each(|frame| frame.backend().change_size(size));
                    size
                });
                sender.respond(result);
            }
            PanelCommand::SetBackground { toplevel_id, background, sender } => {
                let result = self.set_background(&toplevel_id, &background);
                sender.respond(result);
            }
            PanelCommand::SetLockedDown { locked_down, sender } => {
                let result = self.profile.set_locked_down(locked_down).map(|()| {
                    for frame in self.applets.values() {
                        frame.backend().sync_menu_state(frame.locked, locked_down);
                    }
                    if locked_down {
                        "Panel locked down"
                    } else {
                        "Panel lockdown lifted"
                    }
                });
                sender.respond(result);
            }
            PanelCommand::ListApplets(sender) => {
                let output = self
                    .applets
                    .values()
                    .map(|frame| {
                        let mut line = format!("{}\t{}\t{}:{}", frame.id, frame.iid, frame.toplevel_id, frame.position);
                        if frame.locked {
                            line.push_str("\tlocked");
                        }
                        line
                    })
                    .join("\n");
                sender.respond(DaemonResponse::Success(output))
            }
            PanelCommand::Frame { id, generation, event } => self.handle_frame_event(id, generation, event),
            PanelCommand::DescriptorChanged(event) => {
                if self.managers.handle_descriptor_event(&event) {
                    log::info!("Applet descriptors changed, {} applets available", self.managers.get_applets().len());
                }
            }
            PanelCommand::RevealTimeout => {
                if self.load_queue.force_reveal() {
                    self.shell.reveal_toplevels();
                }
            }
            PanelCommand::KillServer => {
                log::info!("Received kill command, stopping server!");
                self.stop_application();
                crate::shutdown::request(ShutdownReason::KillCommand);
            }
        }
        Ok(())
    }

    fn stop_application(&mut self) {
        for (_, mut pending) in self.activating.drain() {
            pending.backend.stop();
        }
        for (_, mut frame) in std::mem::take(&mut self.applets) {
            frame.stop();
        }
    }

    fn applet(&self, id: &str) -> Result<&AppletFrame> {
        self.applets.get(id).with_context(|| format!("No applet {} on the panel", id))
    }

    fn applets_on<'a>(&'a self, toplevel_id: &'a str) -> impl Iterator<Item = &'a AppletFrame> + 'a {
        self.applets.values().filter(move |frame| frame.toplevel_id == toplevel_id)
    }

    fn applet_name(&self, iid: &str) -> String {
        self.managers.get_applet_info(iid).map(|info| info.name.clone()).unwrap_or_else(|| iid.to_string())
    }

    /// The iid of a layout object, migrating objects that only carry a legacy id.
    fn resolve_iid(&mut self, object: &AppletObject) -> Option<String> {
        if let Some(iid) = &object.iid {
            return Some(iid.clone());
        }
        let old_id = object.cafe_component_id.as_ref()?;
        let iid = self.managers.get_applet_info_from_old_id(old_id).map(|info: &AppletInfo| info.iid.clone())?;
        log::info!("Migrating applet {} from {} to {}", object.id, old_id, iid);
        crate::print_result_err!("migrating applet id", self.profile.migrate_object_iid(&object.id, &iid));
        Some(iid)
    }

    fn load_initial_applets(&mut self) {
        let objects = self.profile.layout().objects.clone();
        for object in objects {
            let Some(iid) = self.resolve_iid(&object) else {
                log::warn!("Applet {} has no known applet id, skipping it", object.id);
                continue;
            };
            let activating = FrameActivating {
                id: object.id,
                toplevel_id: object.toplevel_id,
                position: object.position,
                exactpos: false,
                locked: object.locked,
            };
            if self.should_load(&iid, LoadOrigin::Configuration) {
                self.load_queue.queue(QueuedLoad { iid, activating });
            }
        }

        for load in self.load_queue.take_queued() {
            self.activate(load.iid, load.activating);
        }
        if self.load_queue.check_reveal() {
            self.shell.reveal_toplevels();
        }
    }

    fn should_load(&mut self, iid: &str, origin: LoadOrigin) -> bool {
        match origin {
            LoadOrigin::Configuration if self.no_reload.contains(iid) => {
                log::info!("Not loading {}, it failed before", iid);
                false
            }
            LoadOrigin::Configuration => true,
            LoadOrigin::User => {
                self.no_reload.remove(iid);
                true
            }
        }
    }

    fn add_applet(&mut self, iid: String, toplevel_id: &str, position: i32) -> Result<String> {
        if self.profile.is_locked_down() {
            anyhow::bail!("The panel is locked down");
        }
        if self.managers.get_applet_info(&iid).is_none() {
            anyhow::bail!("Unknown applet {}", iid);
        }
        let id = self.profile.add_object(&iid, toplevel_id, position)?;
        self.should_load(&iid, LoadOrigin::User);
        let activating =
            FrameActivating { id: id.clone(), toplevel_id: toplevel_id.to_string(), position, exactpos: false, locked: false };
        self.activate(iid, activating);
        Ok(id)
    }

    /// Tear down the applet `id`, wherever it is in its life, and activate it again.
    fn reload_applet(&mut self, id: &str) -> Result<String> {
        let object = self.profile.object(id).cloned().with_context(|| format!("No applet object {}", id))?;
        let iid = self.resolve_iid(&object).with_context(|| format!("Applet {} has no known applet id", id))?;

        if let Some(mut frame) = self.applets.remove(id) {
            frame.stop();
            self.managers.factory_deactivate(&frame.iid);
        }
        if let Some(mut pending) = self.activating.remove(id) {
            pending.backend.stop();
            self.managers.factory_deactivate(&pending.iid);
        }

        self.should_load(&iid, LoadOrigin::User);
        let activating = FrameActivating {
            id: object.id,
            toplevel_id: object.toplevel_id,
            position: object.position,
            exactpos: true,
            locked: object.locked,
        };
        self.activate(iid.clone(), activating);
        Ok(iid)
    }

    fn set_background(&mut self, toplevel_id: &str, background: &str) -> Result<String> {
        let decoded: Background = background.parse().with_context(|| format!("Invalid background {:?}", background))?;
        self.profile.set_background(toplevel_id, background)?;
        self.applets_on(toplevel_id).for_each(|frame| frame.backend().change_background(&decoded));
        Ok(decoded.to_string())
    }

    fn applet_props(&self, activating: &FrameActivating) -> AppletProps {
        let mut props = AppletProps {
            prefs_path: Some(format!("/org/cafe/panel/objects/{}/prefs/", activating.id)),
            locked: Some(activating.locked),
            locked_down: Some(self.profile.is_locked_down()),
            ..AppletProps::default()
        };
        match self.profile.toplevel(&activating.toplevel_id) {
            Some(toplevel) => {
                props.orient = Some(toplevel.orientation);
                props.size = Some(toplevel.size);
                props.background = Some(toplevel.background.clone());
            }
            None => log::warn!("Applet {} is on unknown toplevel {}", activating.id, activating.toplevel_id),
        }
        props
    }

    fn activate(&mut self, iid: String, activating: FrameActivating) {
        log::debug!("Activating {} as {}", iid, activating.id);
        if let Err(err) = self.managers.factory_activate(&iid) {
            self.loading_failed(&iid, &activating.id, err);
            return;
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let sink: FrameEventSink = {
            let evt_send = self.app_evt_send.clone();
            let id = activating.id.clone();
            Arc::new(move |event| {
                let _ = evt_send.send(PanelCommand::Frame { id: id.clone(), generation, event });
            })
        };

        let mut backend = match self.managers.load_applet(&iid, sink) {
            Ok(backend) => backend,
            Err(err) => {
                self.managers.factory_deactivate(&iid);
                self.loading_failed(&iid, &activating.id, err);
                return;
            }
        };
        backend.load(&iid, self.applet_props(&activating));
        self.activating.insert(activating.id.clone(), PendingActivation { activating, iid, generation, backend });
    }

    fn stop_loading(&mut self, id: &str) {
        if self.load_queue.stop_loading(id) {
            self.shell.reveal_toplevels();
        }
    }

    fn loading_failed(&mut self, iid: &str, id: &str, err: ActivationError) {
        log::warn!("Failed to load applet {} ({}): {}", id, iid, err);
        self.no_reload.insert(iid.to_string());

        let locked_down = self.profile.is_locked_down();
        let failure =
            LoadFailure { id: id.to_string(), iid: iid.to_string(), name: self.applet_name(iid), reason: err.to_string(), locked_down };
        if self.shell.loading_failed(&failure) == LoadFailedResponse::Delete && !locked_down {
            crate::print_result_err!("deleting applet", self.profile.delete_object(id));
            self.no_reload.remove(iid);
        }
        self.stop_loading(id);
    }

    fn handle_frame_event(&mut self, id: String, generation: u64, event: FrameEvent) {
        match event {
            FrameEvent::Loaded(result) => {
                match self.activating.remove(&id) {
                    Some(pending) if pending.generation == generation => match result {
                        Ok(applet) => self.applet_loaded(pending, applet),
                        Err(err) => {
                            self.managers.factory_deactivate(&pending.iid);
                            let PendingActivation { iid, mut backend, .. } = pending;
                            backend.stop();
                            self.loading_failed(&iid, &id, err);
                        }
                    },
                    Some(pending) => {
                        log::debug!("Ignoring outdated load result for {}", id);
                        self.activating.insert(id, pending);
                    }
                    None => log::debug!("Ignoring load result for {}, which is not loading", id),
                }
            }
            FrameEvent::Container(event) => {
                if self.applets.get(&id).is_some_and(|frame| frame.generation == generation) {
                    self.handle_container_event(&id, event);
                } else {
                    log::debug!("Ignoring {:?} of outdated applet {}", event, id);
                }
            }
        }
    }

    fn applet_loaded(&mut self, pending: PendingActivation, applet: AddedApplet) {
        let PendingActivation { activating, iid, generation, backend } = pending;
        let id = activating.id.clone();
        let frame = AppletFrame::new(activating, iid, generation, applet, backend);

        frame.backend().init_properties();
        frame.backend().sync_menu_state(frame.locked, self.profile.is_locked_down());
        if !applet.out_of_process {
            match self.managers.get_applet_widget(&frame.iid, applet.uid) {
                Some(widget) => self.shell.embed_in_process(&id, widget),
                None => log::warn!("In-process applet {} has no widget", id),
            }
        }

        log::info!("Loaded applet {} ({})", id, frame.iid);
        self.applets.insert(id.clone(), frame);
        self.stop_loading(&id);
    }

    fn handle_container_event(&mut self, id: &str, event: ContainerEvent) {
        let locked_down = self.profile.is_locked_down();
        match event {
            ContainerEvent::Broken => self.applet_broken(id),
            ContainerEvent::Move => match self.applets.get(id) {
                Some(frame) if !frame.locked && !locked_down => self.shell.begin_drag(id),
                _ => log::debug!("Applet {} is locked in place", id),
            },
            ContainerEvent::Remove if locked_down => log::info!("Not removing {}, the panel is locked down", id),
            ContainerEvent::Remove => self.remove_applet(id),
            ContainerEvent::Lock(locked) => {
                let Some(frame) = self.applets.get_mut(id) else { return };
                frame.locked = locked;
                frame.backend().sync_menu_state(locked, locked_down);
                crate::print_result_err!("saving applet lock state", self.profile.set_locked(id, locked));
            }
            ContainerEvent::ChildPropertyChanged(prop, value) => {
                let Some(frame) = self.applets.get_mut(id) else { return };
                if frame.handle_property_changed(prop, &value) {
                    log::debug!(
                        "Layout of {} changed: expand_major={} expand_minor={} has_handle={} size_hints={:?}",
                        id,
                        frame.expand_major(),
                        frame.expand_minor(),
                        frame.has_handle(),
                        frame.size_hints()
                    );
                }
            }
        }
    }

    fn remove_applet(&mut self, id: &str) {
        if let Some(mut frame) = self.applets.remove(id) {
            frame.stop();
            self.managers.factory_deactivate(&frame.iid);
        }
        crate::print_result_err!("deleting applet", self.profile.delete_object(id));
        self.shell.applet_removed(id);
    }

    fn applet_broken(&mut self, id: &str) {
        let Some(mut frame) = self.applets.remove(id) else { return };
        frame.stop();
        self.managers.factory_deactivate(&frame.iid);

        let broken = BrokenApplet {
            id: id.to_string(),
            iid: frame.iid.clone(),
            name: self.applet_name(&frame.iid),
            can_delete: self.profile.id_lists_are_writable(),
        };
        match self.shell.applet_broken(&broken) {
            BrokenResponse::Reload => {
                let activating = frame.reactivation();
                let iid = frame.iid.clone();
                drop(frame);
                self.should_load(&iid, LoadOrigin::User);
                self.activate(iid, activating);
            }
            BrokenResponse::Delete => {
                crate::print_result_err!("deleting applet", self.profile.delete_object(id));
                self.shell.applet_removed(id);
            }
            BrokenResponse::DontReload => {
                self.no_reload.insert(frame.iid.clone());
                self.shell.applet_removed(id);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{applets_manager::AppletsManager, profile::PanelLayout};
    use cafe_panel_applet::shlib::WidgetPtr;
    use pretty_assertions::assert_eq;
    use std::{path::PathBuf, sync::Mutex};
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    type Log = Arc<Mutex<Vec<String>>>;

    struct FakeBackend {
        sink: FrameEventSink,
        fail: bool,
        log: Log,
    }

    impl AppletFrameBackend for FakeBackend {
        fn load(&mut self, iid: &str, props: AppletProps) {
            self.log.lock().unwrap().push(format!("load {} size={:?} locked={:?}", iid, props.size, props.locked));
            let result = if self.fail { Err(ActivationError::NoSessionBus) } else { Ok(AddedApplet { out_of_process: true, xid: 7, uid: 0 }) };
            (self.sink)(FrameEvent::Loaded(result));
        }

        fn init_properties(&self) {
            self.log.lock().unwrap().push("init".to_string());
        }

        fn sync_menu_state(&self, locked: bool, locked_down: bool) {
            self.log.lock().unwrap().push(format!("menu locked={} locked_down={}", locked, locked_down));
        }

        fn popup_menu(&self, button: u32, time: u32) {
            self.log.lock().unwrap().push(format!("popup {} {}", button, time));
        }

        fn change_orientation(&self, orientation: Orientation) {
            self.log.lock().unwrap().push(format!("orient {}", orientation));
        }

        fn change_size(&self, size: u32) {
            self.log.lock().unwrap().push(format!("size {}", size));
        }

        fn change_background(&self, background: &Background) {
            self.log.lock().unwrap().push(format!("background {}", background));
        }

        fn stop(&mut self) {}
    }

    struct FakeManager {
        applets: Vec<AppletInfo>,
        failing: HashSet<String>,
        log: Log,
    }

    impl AppletsManager for FakeManager {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn get_applets(&self) -> Vec<&AppletInfo> {
            self.applets.iter().collect()
        }

        fn get_applet_info(&self, iid: &str) -> Option<&AppletInfo> {
            self.applets.iter().find(|applet| applet.iid == iid)
        }

        fn get_applet_info_from_old_id(&self, old_id: &str) -> Option<&AppletInfo> {
            self.applets.iter().find(|applet| applet.old_ids.iter().any(|id| id == old_id))
        }

        fn factory_activate(&mut self, iid: &str) -> Result<(), ActivationError> {
            self.log.lock().unwrap().push(format!("activate {}", iid));
            Ok(())
        }

        fn factory_deactivate(&mut self, iid: &str) {
            self.log.lock().unwrap().push(format!("deactivate {}", iid));
        }

        fn load_applet(&self, iid: &str, sink: FrameEventSink) -> Result<Box<dyn AppletFrameBackend>, ActivationError> {
            Ok(Box::new(FakeBackend { sink, fail: self.failing.contains(iid), log: self.log.clone() }))
        }

        fn get_applet_widget(&self, _iid: &str, _uid: u32) -> Option<WidgetPtr> {
            None
        }

        fn handle_descriptor_event(&mut self, _event: &DescriptorEvent) -> bool {
            false
        }

        fn watched_dirs(&self) -> Vec<PathBuf> {
            Vec::new()
        }
    }

    struct FakeShell {
        on_failure: LoadFailedResponse,
        on_broken: BrokenResponse,
        log: Log,
    }

    impl PanelShell for FakeShell {
        fn loading_failed(&mut self, failure: &LoadFailure) -> LoadFailedResponse {
            self.log.lock().unwrap().push(format!("failed {}", failure.id));
            self.on_failure
        }

        fn applet_broken(&mut self, applet: &BrokenApplet) -> BrokenResponse {
            self.log.lock().unwrap().push(format!("broken {}", applet.id));
            self.on_broken
        }

        fn begin_drag(&mut self, id: &str) {
            self.log.lock().unwrap().push(format!("drag {}", id));
        }

        fn reveal_toplevels(&mut self) {
            self.log.lock().unwrap().push("reveal".to_string());
        }

        fn embed_in_process(&mut self, id: &str, _widget: WidgetPtr) {
            self.log.lock().unwrap().push(format!("embed {}", id));
        }

        fn applet_removed(&mut self, id: &str) {
            self.log.lock().unwrap().push(format!("removed {}", id));
        }
    }

    fn info(iid: &str, old_id: &str) -> AppletInfo {
        AppletInfo {
            iid: iid.to_string(),
            name: iid.to_string(),
            description: String::new(),
            icon: None,
            old_ids: vec![old_id.to_string()],
            x11_supported: true,
            wayland_supported: true,
        }
    }

    const LAYOUT: &str = r#"{
        "toplevels": [{ "id": "bottom", "size": 32 }],
        "objects": [
            { "id": "clock", "iid": "clock::ClockApplet", "toplevel_id": "bottom", "position": 10 },
            { "id": "trash", "cafe_component_id": "OAFIID:Trash", "toplevel_id": "bottom", "position": 2, "locked": true },
            { "id": "broken", "iid": "broken::BrokenApplet", "toplevel_id": "bottom", "position": 5 }
        ]
    }"#;

    struct Harness {
        app: App,
        recv: UnboundedReceiver<PanelCommand>,
        backend_log: Log,
        shell_log: Log,
    }

    impl Harness {
        fn new(on_failure: LoadFailedResponse, on_broken: BrokenResponse) -> Self {
            let backend_log = Log::default();
            let shell_log = Log::default();
            let manager = FakeManager {
                applets: vec![
                    info("clock::ClockApplet", "OAFIID:Clock"),
                    info("trash::TrashApplet", "OAFIID:Trash"),
                    info("broken::BrokenApplet", "OAFIID:Broken"),
                ],
                failing: HashSet::from(["broken::BrokenApplet".to_string()]),
                log: backend_log.clone(),
            };
            let shell = FakeShell { on_failure, on_broken, log: shell_log.clone() };
            let (send, recv) = mpsc::unbounded_channel();
            let layout: PanelLayout = serde_json::from_str(LAYOUT).unwrap();
            let app = App::new(AppletsManagers::new(vec![Box::new(manager)]), Profile::in_memory(layout), Box::new(shell), send);
            Harness { app, recv, backend_log, shell_log }
        }

        fn run(&mut self, command: PanelCommand) {
            self.app.handle_command(command);
            while let Ok(command) = self.recv.try_recv() {
                self.app.handle_command(command);
            }
        }

        fn take_backend_log(&self) -> Vec<String> {
            std::mem::take(&mut *self.backend_log.lock().unwrap())
        }

        fn take_shell_log(&self) -> Vec<String> {
            std::mem::take(&mut *self.shell_log.lock().unwrap())
        }

        fn container_event(&mut self, id: &str, event: ContainerEvent) {
            let generation = self.app.applets[id].generation;
            self.run(PanelCommand::Frame { id: id.to_string(), generation, event: FrameEvent::Container(event) });
        }
    }

    #[test]
    fn test_initial_load() {
        let mut harness = Harness::new(LoadFailedResponse::Keep, BrokenResponse::DontReload);
        harness.run(PanelCommand::LoadInitialApplets);

        assert_eq!(harness.app.applets.keys().collect::<Vec<_>>(), vec!["clock", "trash"]);
        assert_eq!(harness.app.profile.object("trash").unwrap().iid.as_deref(), Some("trash::TrashApplet"));
        assert!(harness.app.no_reload.contains("broken::BrokenApplet"));
        assert!(harness.app.profile.object("broken").is_some());
        assert!(harness.app.load_queue.is_revealed());
        assert_eq!(harness.take_shell_log(), vec!["failed broken", "reveal"]);

        let backend_log = harness.take_backend_log();
        assert_eq!(&backend_log[..2], &["activate trash::TrashApplet", "load trash::TrashApplet size=Some(32) locked=Some(true)"]);
        assert!(backend_log.contains(&"deactivate broken::BrokenApplet".to_string()));
        assert!(backend_log.contains(&"menu locked=true locked_down=false".to_string()));
    }

    #[test]
    fn test_failed_applet_can_be_deleted_and_is_skipped_until_reloaded() {
        let mut harness = Harness::new(LoadFailedResponse::Delete, BrokenResponse::DontReload);
        harness.run(PanelCommand::LoadInitialApplets);
        assert!(harness.app.profile.object("broken").is_none());
        assert!(!harness.app.no_reload.contains("broken::BrokenApplet"));

        let mut harness = Harness::new(LoadFailedResponse::Keep, BrokenResponse::DontReload);
        harness.app.no_reload.insert("clock::ClockApplet".to_string());
        harness.run(PanelCommand::LoadInitialApplets);
        assert!(!harness.app.applets.contains_key("clock"));

        let (sender, mut recv) = crate::response::channel();
        harness.run(PanelCommand::ReloadApplet { id: "clock".to_string(), sender });
        assert!(recv.try_recv().unwrap().is_success());
        assert!(harness.app.applets.contains_key("clock"));
        assert!(!harness.app.no_reload.contains("clock::ClockApplet"));
    }

    #[test]
    fn test_broken_applet_reloads_in_place() {
        let mut harness = Harness::new(LoadFailedResponse::Keep, BrokenResponse::Reload);
        harness.run(PanelCommand::LoadInitialApplets);
        let old_generation = harness.app.applets["clock"].generation;
        harness.take_backend_log();

        harness.container_event("clock", ContainerEvent::Broken);
        let clock = &harness.app.applets["clock"];
        assert!(clock.generation > old_generation);
        assert_eq!(clock.position, 10);
        assert_eq!(&harness.take_backend_log()[..3], &[
            "deactivate clock::ClockApplet",
            "activate clock::ClockApplet",
            "load clock::ClockApplet size=Some(32) locked=Some(false)"
        ]);

        // events of the frame that broke no longer reach the new one
        harness.run(PanelCommand::Frame { id: "clock".to_string(), generation: old_generation, event: FrameEvent::Container(ContainerEvent::Remove) });
        assert!(harness.app.applets.contains_key("clock"));
        assert!(harness.app.profile.object("clock").is_some());
    }

    #[test]
    fn test_broken_applet_dont_reload() {
        let mut harness = Harness::new(LoadFailedResponse::Keep, BrokenResponse::DontReload);
        harness.run(PanelCommand::LoadInitialApplets);
        harness.take_shell_log();

        harness.container_event("clock", ContainerEvent::Broken);
        assert!(!harness.app.applets.contains_key("clock"));
        assert!(harness.app.profile.object("clock").is_some());
        assert_eq!(harness.take_shell_log(), vec!["broken clock", "removed clock"]);
    }

    #[test]
    fn test_lock_move_and_remove() {
        let mut harness = Harness::new(LoadFailedResponse::Keep, BrokenResponse::DontReload);
        harness.run(PanelCommand::LoadInitialApplets);
        harness.take_shell_log();

        harness.container_event("trash", ContainerEvent::Move);
        harness.container_event("trash", ContainerEvent::Lock(false));
        harness.container_event("trash", ContainerEvent::Move);
        assert_eq!(harness.take_shell_log(), vec!["drag trash"]);
        assert!(!harness.app.profile.object("trash").unwrap().locked);

        let (sender, _recv) = crate::response::channel();
        harness.run(PanelCommand::SetLockedDown { locked_down: true, sender });
        harness.container_event("clock", ContainerEvent::Remove);
        assert!(harness.app.applets.contains_key("clock"));

        let (sender, _recv) = crate::response::channel();
        harness.run(PanelCommand::SetLockedDown { locked_down: false, sender });
        harness.container_event("clock", ContainerEvent::Remove);
        assert!(!harness.app.applets.contains_key("clock"));
        assert!(harness.app.profile.object("clock").is_none());
        assert_eq!(harness.take_shell_log(), vec!["removed clock"]);
    }

    #[test]
    fn test_toplevel_changes_reach_applets() {
        let mut harness = Harness::new(LoadFailedResponse::Keep, BrokenResponse::DontReload);
        harness.run(PanelCommand::LoadInitialApplets);
        harness.take_backend_log();

        let (sender, mut recv) = crate::response::channel();
        harness.run(PanelCommand::SetSize { toplevel_id: "bottom".to_string(), size: 48, sender });
        assert!(recv.try_recv().unwrap().is_success());
        assert_eq!(harness.take_backend_log(), vec!["size 48", "size 48"]);

        let (sender, mut recv) = crate::response::channel();
        harness.run(PanelCommand::SetBackground { toplevel_id: "bottom".to_string(), background: "pixmap:nope".to_string(), sender });
        assert!(!recv.try_recv().unwrap().is_success());
        assert!(harness.take_backend_log().is_empty());
        assert_eq!(harness.app.profile.toplevel("bottom").unwrap().background, "none");

        let (sender, mut recv) = crate::response::channel();
        harness.run(PanelCommand::SetOrientation { toplevel_id: "top".to_string(), orientation: Orientation::Left, sender });
        assert!(!recv.try_recv().unwrap().is_success());
    }

    #[test]
    fn test_add_applet() {
        let mut harness = Harness::new(LoadFailedResponse::Keep, BrokenResponse::DontReload);
        let (sender, mut recv) = crate::response::channel();
        harness.run(PanelCommand::AddApplet { iid: "clock::ClockApplet".to_string(), toplevel_id: "bottom".to_string(), position: 0, sender });
        assert_eq!(recv.try_recv().unwrap(), DaemonResponse::Success("object-0".to_string()));
        assert!(harness.app.applets.contains_key("object-0"));

        let (sender, mut recv) = crate::response::channel();
        harness.run(PanelCommand::AddApplet { iid: "nope::Nope".to_string(), toplevel_id: "bottom".to_string(), position: 0, sender });
        assert!(!recv.try_recv().unwrap().is_success());

        let (sender, mut recv) = crate::response::channel();
        harness.run(PanelCommand::ListApplets(sender));
        assert_eq!(recv.try_recv().unwrap(), DaemonResponse::Success("object-0\tclock::ClockApplet\tbottom:0".to_string()));
    }
}
