use std::{os::unix::net, path::Path, time::Duration};

use anyhow::{Context, Result};
use opts::ActionWithServer;
use paths::PanelPaths;
use response::DaemonResponse;

mod app;
mod applet_info;
mod applets_manager;
mod applets_registry;
mod client;
mod container;
mod dialogs;
mod frame;
mod ipc_server;
mod load_queue;
mod module_loader;
mod opts;
mod paths;
mod profile;
mod response;
mod server;
mod shutdown;
mod util;

fn main() {
    let opts: opts::Opt = opts::Opt::from_env();

    let log_level_filter = if opts.log_debug { log::LevelFilter::Debug } else { log::LevelFilter::Info };
    if std::env::var("RUST_LOG").is_ok() {
        pretty_env_logger::init_timed();
    } else {
        pretty_env_logger::formatted_timed_builder()
            .filter(Some("cafe_panel"), log_level_filter)
            .filter(Some("cafe_panel_applet"), log_level_filter)
            .init();
    }

    if let Err(err) = run(opts) {
        log::error!("{:?}", err);
        std::process::exit(1);
    }
}

fn run(opts: opts::Opt) -> Result<()> {
    let paths = PanelPaths::from_env(opts.layout_path).context("Failed to initialize panel paths")?;

    match opts.action {
        opts::Action::ClientOnly(action) => client::handle_client_only_action(&paths, action)?,

        // make sure that there isn't already a panel daemon running.
        opts::Action::Daemon { .. } if check_server_running(paths.get_ipc_socket_file()) => {
            eprintln!("cafe-panel daemon already running.");
        }
        opts::Action::Daemon { on_broken, on_failure } => {
            log::info!("Initializing cafe-panel daemon. ({})", paths.get_ipc_socket_file().display());
            let _ = std::fs::remove_file(paths.get_ipc_socket_file());
            let shell = dialogs::ConsoleShell::new(on_broken, on_failure);
            server::initialize_server(paths, Box::new(shell))?;
        }

        opts::Action::WithServer(action) => {
            if let Some(response) = handle_server_command(&paths, &action, 5)? {
                handle_daemon_response(response);
            }
        }
    }
    Ok(())
}

/// attempt to send a command to the daemon and send it the given action repeatedly.
fn handle_server_command(paths: &PanelPaths, action: &ActionWithServer, connect_attempts: usize) -> Result<Option<DaemonResponse>> {
    log::debug!("Trying to find server process at socket {}", paths.get_ipc_socket_file().display());
    let mut stream = attempt_connect(paths.get_ipc_socket_file(), connect_attempts).context("Failed to connect to daemon")?;
    log::debug!("Connected to cafe-panel daemon ({}).", &paths.get_ipc_socket_file().display());
    client::do_server_call(&mut stream, action).context("Error while forwarding command to server")
}

fn handle_daemon_response(res: DaemonResponse) {
    match res {
        DaemonResponse::Success(x) => println!("{}", x),
        DaemonResponse::Failure(x) => {
            eprintln!("{}", x);
            std::process::exit(1);
        }
    }
}

fn attempt_connect(socket_path: impl AsRef<Path>, attempts: usize) -> Option<net::UnixStream> {
    for _ in 0..attempts {
        if let Ok(mut con) = net::UnixStream::connect(&socket_path) {
            if client::do_server_call(&mut con, &opts::ActionWithServer::Ping).is_ok() {
                return net::UnixStream::connect(&socket_path).ok();
            }
        }
        std::thread::sleep(Duration::from_millis(200));
    }
    None
}

/// Check if a panel daemon is currently running by trying to send a ping message to it.
fn check_server_running(socket_path: impl AsRef<Path>) -> bool {
    let response = net::UnixStream::connect(socket_path)
        .ok()
        .and_then(|mut stream| client::do_server_call(&mut stream, &opts::ActionWithServer::Ping).ok());
    response.is_some()
}
