use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use cafe_panel_applet::Platform;
use tokio::sync::mpsc::*;

use crate::{
    app::{App, PanelCommand},
    applets_manager::{AppletsManagers, DBusAppletsManager},
    applets_registry::{self, AppletsRegistry},
    container::SocketFactory,
    dialogs::PanelShell,
    module_loader::DlModuleLoader,
    paths::PanelPaths,
    profile::{PanelLayout, Profile},
};

/// Give up waiting for slow applets after this long and show the panel anyway.
const REVEAL_TIMEOUT: Duration = Duration::from_secs(5);

pub fn initialize_server(paths: PanelPaths, shell: Box<dyn PanelShell>) -> Result<()> {
    log::info!("Loading paths: {}", &paths);

    println!(
        r#"
┏━━━━━━━━━━━━━━━━━━━━━━━━━━━━━┓
┃Initializing cafe-panel daemon┃
┗━━━━━━━━━━━━━━━━━━━━━━━━━━━━━┛
    "#
    );

    simple_signal::set_handler(&[simple_signal::Signal::Int, simple_signal::Signal::Term], move |signals| {
        crate::shutdown::request(crate::shutdown::ShutdownReason::from_signals(signals));
    });

    let rt = tokio::runtime::Builder::new_current_thread()
        .thread_name("cafe-panel")
        .enable_all()
        .build()
        .context("Failed to initialize tokio runtime")?;
    rt.block_on(run_panel(paths, shell))
}

async fn run_panel(paths: PanelPaths, shell: Box<dyn PanelShell>) -> Result<()> {
    let (ui_send, mut ui_recv) = unbounded_channel();

    let connection = match zbus::Connection::session().await {
        Ok(connection) => Some(connection),
        Err(err) => {
            log::warn!("Failed to connect to the session bus, out-of-process applets will not load: {}", err);
            None
        }
    };

    let platform = Platform::detect();
    log::debug!("Running on {}", platform);
    let registry = AppletsRegistry::load(paths.applet_dirs.clone());
    let manager = DBusAppletsManager::new(
        registry,
        Box::new(DlModuleLoader),
        platform,
        connection,
        socket_factory(platform),
        cafe_panel_applet::default_screen_number(),
    );

    let profile = match Profile::load(paths.get_layout_file()) {
        Ok(profile) => profile,
        Err(err) => {
            log::error!("{:?}", err);
            Profile::in_memory(PanelLayout::default())
        }
    };

    let mut app = App::new(AppletsManagers::new(vec![Box::new(manager)]), profile, shell, ui_send.clone());

    // initialize all the handlers and tasks running asyncronously
    init_async_part(app.managers.watched_dirs(), paths.ipc_socket_file.clone(), ui_send.clone());

    ui_send.send(PanelCommand::LoadInitialApplets).context("Failed to queue initial applet load")?;

    while let Some(command) = ui_recv.recv().await {
        let is_kill = matches!(command, PanelCommand::KillServer);
        app.handle_command(command);
        if is_kill {
            break;
        }
    }
    log::info!("main application loop finished");
    Ok(())
}

#[cfg(feature = "x11")]
fn socket_factory(platform: Platform) -> Option<Arc<dyn SocketFactory>> {
    match platform {
        Platform::X11 => Some(Arc::new(crate::container::X11SocketFactory::new(cafe_panel_applet::default_screen_number()))),
        Platform::Wayland => None,
    }
}

#[cfg(not(feature = "x11"))]
fn socket_factory(_platform: Platform) -> Option<Arc<dyn SocketFactory>> {
    None
}

fn init_async_part(applet_dirs: Vec<PathBuf>, ipc_socket_file: PathBuf, ui_send: UnboundedSender<PanelCommand>) {
    let descriptor_watch_handle = {
        let ui_send = ui_send.clone();
        tokio::spawn(async move { run_descriptor_forwarding(applet_dirs, ui_send).await })
    };

    let ipc_server_handle = {
        let ui_send = ui_send.clone();
        tokio::spawn(async move { crate::ipc_server::run_server(ui_send, ipc_socket_file).await })
    };

    {
        let ui_send = ui_send.clone();
        tokio::spawn(async move {
            tokio::time::sleep(REVEAL_TIMEOUT).await;
            let _ = ui_send.send(PanelCommand::RevealTimeout);
        });
    }

    let forward_exit_to_app_handle = tokio::spawn(async move {
        let reason = crate::shutdown::wait().await;
        log::debug!("Forwarding shutdown to the app ({})", reason);
        let _ = ui_send.send(PanelCommand::KillServer);
    });

    tokio::spawn(async move {
        let result = tokio::try_join!(descriptor_watch_handle, ipc_server_handle, forward_exit_to_app_handle);
        match result {
            Ok((descriptor_watch, ipc_server, ())) => {
                crate::print_result_err!("watching applet descriptors", descriptor_watch);
                crate::print_result_err!("running the IPC server", ipc_server);
            }
            Err(e) => log::error!("cafe-panel exiting with error: {:?}", e),
        }
    });
}

/// Watch the applet directories, handing every descriptor change to the app.
async fn run_descriptor_forwarding(applet_dirs: Vec<PathBuf>, ui_send: UnboundedSender<PanelCommand>) -> Result<()> {
    let (evt_send, mut evt_recv) = unbounded_channel();
    let watch_handle = tokio::spawn(applets_registry::run_descriptor_watch(applet_dirs, evt_send));

    crate::loop_select_until_shutdown! {
        Some(event) = evt_recv.recv() => {
            log::debug!("Applet descriptor event: {:?}", event);
            ui_send.send(PanelCommand::DescriptorChanged(event))?;
        },
        else => break,
    }
    watch_handle.await.context("Descriptor watch task failed")?
}
