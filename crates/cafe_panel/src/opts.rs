use std::path::PathBuf;

use cafe_panel_applet::Orientation;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use crate::{
    app::PanelCommand,
    dialogs::{BrokenPolicy, FailurePolicy},
    response::{self, DaemonResponse, Responder, ResponseReceiver},
};

/// Struct that gets generated from `RawOpt`.
#[derive(Debug, PartialEq)]
pub struct Opt {
    pub log_debug: bool,
    pub layout_path: Option<PathBuf>,
    pub action: Action,
}

#[derive(Parser, Debug, PartialEq)]
#[command(name = "cafe-panel", version)]
struct RawOpt {
    /// Write out debug logs.
    #[arg(long = "debug", global = true)]
    log_debug: bool,

    /// Override the path of the panel layout file.
    #[arg(short, long, global = true)]
    layout: Option<PathBuf>,

    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Action {
    /// Start the panel daemon.
    #[command(name = "daemon", alias = "d")]
    Daemon {
        /// What to do when an applet quits unexpectedly.
        #[arg(long, value_enum, default_value_t)]
        on_broken: BrokenPolicy,

        /// What to do with applets that fail to load.
        #[arg(long, value_enum, default_value_t)]
        on_failure: FailurePolicy,
    },

    #[command(flatten)]
    ClientOnly(ActionClientOnly),

    #[command(flatten)]
    WithServer(ActionWithServer),
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum ActionClientOnly {
    /// Print the applets installed on this system, without asking the daemon.
    #[command(name = "list-applets")]
    ListApplets,
}

#[derive(Subcommand, Debug, Serialize, Deserialize, PartialEq)]
pub enum ActionWithServer {
    /// Ping the panel daemon, checking if it is reachable.
    #[command(name = "ping")]
    Ping,

    /// Print the applets currently on the panel.
    #[command(name = "list", alias = "ls")]
    List,

    /// Add an applet to a toplevel.
    #[command(name = "add", alias = "a")]
    Add {
        /// Applet id, formatted like `FactoryId::AppletId`.
        iid: String,

        /// Toplevel to put the applet on.
        toplevel: String,

        #[arg(short, long, default_value_t = 0, allow_negative_numbers = true)]
        position: i32,
    },

    /// Reload an applet, even one that was told not to come back.
    #[command(name = "reload", alias = "r")]
    Reload { id: String },

    /// Show the context menu of an applet.
    #[command(name = "popup")]
    Popup {
        id: String,

        #[arg(short, long, default_value_t = 3)]
        button: u32,

        #[arg(short, long, default_value_t = 0)]
        time: u32,
    },

    /// Change the orientation of a toplevel.
    #[command(name = "orientation")]
    Orientation { toplevel: String, orientation: Orientation },

    /// Change the size of a toplevel.
    #[command(name = "size")]
    Size { toplevel: String, size: u32 },

    /// Change the background of a toplevel, like `none`, `color:#ff0000` or `pixmap:<xid>,<x>,<y>`.
    #[command(name = "background")]
    Background { toplevel: String, background: String },

    /// Lock the panel down, or lift the lockdown.
    #[command(name = "lockdown")]
    Lockdown {
        #[arg(action = clap::ArgAction::Set)]
        locked_down: bool,
    },

    /// Kill the panel daemon.
    #[command(name = "kill", alias = "k")]
    KillServer,
}

impl Opt {
    pub fn from_env() -> Self {
        let raw: RawOpt = RawOpt::parse();
        raw.into()
    }
}

impl From<RawOpt> for Opt {
    fn from(other: RawOpt) -> Self {
        let RawOpt { action, log_debug, layout } = other;
        Opt { action, log_debug, layout_path: layout }
    }
}

impl ActionWithServer {
    pub fn into_daemon_command(self) -> (PanelCommand, Option<ResponseReceiver>) {
        let command = match self {
            ActionWithServer::Ping => {
                let (responder, recv) = response::channel();
                responder.respond(DaemonResponse::Success("pong".to_owned()));
                return (PanelCommand::NoOp, Some(recv));
            }
            ActionWithServer::KillServer => PanelCommand::KillServer,
            ActionWithServer::List => return with_response_channel(PanelCommand::ListApplets),
            ActionWithServer::Add { iid, toplevel, position } => {
                return with_response_channel(|sender| PanelCommand::AddApplet { iid, toplevel_id: toplevel, position, sender });
            }
            ActionWithServer::Reload { id } => return with_response_channel(|sender| PanelCommand::ReloadApplet { id, sender }),
            ActionWithServer::Popup { id, button, time } => {
                return with_response_channel(|sender| PanelCommand::PopupMenu { id, button, time, sender });
            }
            ActionWithServer::Orientation { toplevel, orientation } => {
                return with_response_channel(|sender| PanelCommand::SetOrientation { toplevel_id: toplevel, orientation, sender });
            }
            ActionWithServer::Size { toplevel, size } => {
                return with_response_channel(|sender| PanelCommand::SetSize { toplevel_id: toplevel, size, sender });
            }
            ActionWithServer::Background { toplevel, background } => {
                return with_response_channel(|sender| PanelCommand::SetBackground { toplevel_id: toplevel, background, sender });
            }
            ActionWithServer::Lockdown { locked_down } => {
                return with_response_channel(|sender| PanelCommand::SetLockedDown { locked_down, sender });
            }
        };
        (command, None)
    }
}

fn with_response_channel<O, F>(f: F) -> (O, Option<ResponseReceiver>)
where
    F: FnOnce(Responder) -> O,
{
    let (sender, recv) = response::channel();
    (f(sender), Some(recv))
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(args: &[&str]) -> Opt {
        RawOpt::try_parse_from(std::iter::once("cafe-panel").chain(args.iter().copied())).unwrap().into()
    }

    #[test]
    fn test_parse_daemon() {
        let opt = parse(&["daemon", "--debug", "--on-broken", "reload"]);
        assert!(opt.log_debug);
        assert_eq!(opt.action, Action::Daemon { on_broken: BrokenPolicy::Reload, on_failure: FailurePolicy::Keep });

        let opt = parse(&["--layout", "/tmp/layout.json", "d"]);
        assert_eq!(opt.layout_path, Some(PathBuf::from("/tmp/layout.json")));
        assert_eq!(opt.action, Action::Daemon { on_broken: BrokenPolicy::DontReload, on_failure: FailurePolicy::Keep });
    }

    #[test]
    fn test_parse_server_actions() {
        assert_eq!(
            parse(&["add", "ClockAppletFactory::ClockApplet", "bottom", "-p", "-1"]).action,
            Action::WithServer(ActionWithServer::Add {
                iid: "ClockAppletFactory::ClockApplet".to_string(),
                toplevel: "bottom".to_string(),
                position: -1,
            })
        );
        assert_eq!(
            parse(&["orientation", "bottom", "left"]).action,
            Action::WithServer(ActionWithServer::Orientation { toplevel: "bottom".to_string(), orientation: Orientation::Left })
        );
        assert_eq!(parse(&["lockdown", "true"]).action, Action::WithServer(ActionWithServer::Lockdown { locked_down: true }));
        assert_eq!(parse(&["list-applets"]).action, Action::ClientOnly(ActionClientOnly::ListApplets));
        assert!(RawOpt::try_parse_from(["cafe-panel", "orientation", "bottom", "sideways"]).is_err());
    }

    #[test]
    fn test_ping_is_answered_without_daemon_work() {
        let (command, recv) = ActionWithServer::Ping.into_daemon_command();
        assert!(matches!(command, PanelCommand::NoOp));
        let mut recv = recv.unwrap();
        assert_eq!(recv.try_recv().unwrap(), DaemonResponse::Success("pong".to_string()));

        let (command, recv) = ActionWithServer::KillServer.into_daemon_command();
        assert!(matches!(command, PanelCommand::KillServer));
        assert!(recv.is_none());
    }

    #[test]
    fn test_actions_survive_ipc_encoding() {
        let action = ActionWithServer::Popup { id: "object-2".to_string(), button: 3, time: 42 };
        let bytes = bincode::serialize(&action).unwrap();
        assert_eq!(bincode::deserialize::<ActionWithServer>(&bytes).unwrap(), action);
    }
}
