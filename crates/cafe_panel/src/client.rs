use std::{
    io::{Read, Write},
    os::unix::net::UnixStream,
};

use anyhow::{Context, Result};
use cafe_panel_applet::Platform;

use crate::{
    applets_registry::AppletsRegistry,
    response::DaemonResponse,
    opts::{self, ActionClientOnly},
    paths::PanelPaths,
    util,
};

pub fn handle_client_only_action(paths: &PanelPaths, action: ActionClientOnly) -> Result<()> {
    match action {
        ActionClientOnly::ListApplets => {
            let registry = AppletsRegistry::load(paths.applet_dirs.clone());
            let platform = Platform::detect();
            let mut stdout = std::io::stdout().lock();
            for applet in registry.get_applets() {
                let marker = if applet.supports(platform) { ' ' } else { '!' };
                writeln!(stdout, "{}{}\t{}\t{}", marker, applet.iid, applet.name, util::truncate_with_ellipsis(&applet.description, 60))?;
            }
        }
    }
    Ok(())
}

/// Connect to the daemon and send the given request.
/// Returns the response from the daemon, or None if the daemon did not provide any useful response. An Ok(None) response does _not_ indicate failure.
pub fn do_server_call(stream: &mut UnixStream, action: &opts::ActionWithServer) -> Result<Option<DaemonResponse>> {
    log::debug!("Forwarding options to server");
    stream.set_nonblocking(false).context("Failed to set stream to blocking")?;

    let message_bytes = bincode::serialize(&action)?;

    stream.write_all(&(message_bytes.len() as u32).to_be_bytes()).context("Failed to send command size header to IPC stream")?;

    stream.write_all(&message_bytes).context("Failed to write command to IPC stream")?;

    let mut buf = Vec::new();
    stream.set_read_timeout(Some(std::time::Duration::from_millis(500))).context("Failed to set read timeout")?;
    stream.read_to_end(&mut buf).context("Error reading response from server")?;

    Ok(if buf.is_empty() {
        None
    } else {
        let buf = bincode::deserialize(&buf)?;
        Some(buf)
    })
}
