//! What the panel asks of its user interface.

use cafe_panel_applet::shlib::WidgetPtr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadFailure {
    pub id: String,
    pub iid: String,
    pub name: String,
    pub reason: String,
    pub locked_down: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadFailedResponse {
    Keep,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokenApplet {
    pub id: String,
    pub iid: String,
    pub name: String,
    pub can_delete: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokenResponse {
    Delete,
    DontReload,
    Reload,
}

/// Choices offered when an applet could not be loaded. Only an acknowledgement when locked down.
pub fn loading_failed_responses(locked_down: bool) -> Vec<LoadFailedResponse> {
    if locked_down {
        vec![LoadFailedResponse::Keep]
    } else {
        vec![LoadFailedResponse::Keep, LoadFailedResponse::Delete]
    }
}

pub fn broken_responses(can_delete: bool) -> Vec<BrokenResponse> {
    let mut responses = Vec::new();
    if can_delete {
        responses.push(BrokenResponse::Delete);
    }
    responses.extend([BrokenResponse::DontReload, BrokenResponse::Reload]);
    responses
}

impl LoadFailure {
    pub fn message(&self) -> String {
        let mut message = format!("The panel encountered a problem while loading \"{}\".", self.name);
        if !self.locked_down {
            message.push_str(" Do you want to delete the applet from your configuration?");
        }
        message
    }
}

impl BrokenApplet {
    pub fn message(&self) -> String {
        format!(
            "\"{}\" has quit unexpectedly. If you reload a panel object, it will automatically be added back to the panel.",
            self.name
        )
    }
}

/// The user facing side of the panel.
pub trait PanelShell {
    fn loading_failed(&mut self, failure: &LoadFailure) -> LoadFailedResponse;
    fn applet_broken(&mut self, applet: &BrokenApplet) -> BrokenResponse;
    /// The user wants to move an applet.
    fn begin_drag(&mut self, id: &str);
    /// Show the toplevels once their applets are loaded.
    fn reveal_toplevels(&mut self);
    fn embed_in_process(&mut self, id: &str, widget: WidgetPtr);
    fn applet_removed(&mut self, id: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum BrokenPolicy {
    Delete,
    #[default]
    DontReload,
    Reload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum FailurePolicy {
    #[default]
    Keep,
    Delete,
}

/// Answers every question with a fixed policy and logs what it would have shown.
#[derive(Debug, Default)]
pub struct ConsoleShell {
    on_broken: BrokenPolicy,
    on_failure: FailurePolicy,
    revealed: bool,
}

impl ConsoleShell {
    pub fn new(on_broken: BrokenPolicy, on_failure: FailurePolicy) -> Self {
        ConsoleShell { on_broken, on_failure, revealed: false }
    }
}

impl PanelShell for ConsoleShell {
    fn loading_failed(&mut self, failure: &LoadFailure) -> LoadFailedResponse {
        log::warn!("{} ({}: {})", failure.message(), failure.iid, failure.reason);
        let wanted = match self.on_failure {
            FailurePolicy::Keep => LoadFailedResponse::Keep,
            FailurePolicy::Delete => LoadFailedResponse::Delete,
        };
        if loading_failed_responses(failure.locked_down).contains(&wanted) {
            wanted
        } else {
            LoadFailedResponse::Keep
        }
    }

    fn applet_broken(&mut self, applet: &BrokenApplet) -> BrokenResponse {
        log::warn!("{} ({})", applet.message(), applet.iid);
        let wanted = match self.on_broken {
            BrokenPolicy::Delete => BrokenResponse::Delete,
            BrokenPolicy::DontReload => BrokenResponse::DontReload,
            BrokenPolicy::Reload => BrokenResponse::Reload,
        };
        if broken_responses(applet.can_delete).contains(&wanted) {
            wanted
        } else {
            BrokenResponse::DontReload
        }
    }

    fn begin_drag(&mut self, id: &str) {
        log::info!("Applet {} wants to be moved", id);
    }

    fn reveal_toplevels(&mut self) {
        if !self.revealed {
            log::info!("Revealing panel toplevels");
            self.revealed = true;
        }
    }

    fn embed_in_process(&mut self, id: &str, widget: WidgetPtr) {
        log::info!("Embedding in-process applet {} (widget {:p})", id, widget.as_ptr());
    }

    fn applet_removed(&mut self, id: &str) {
        log::debug!("Applet {} left the panel", id);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_responses() {
        assert_eq!(loading_failed_responses(true), vec![LoadFailedResponse::Keep]);
        assert_eq!(loading_failed_responses(false), vec![LoadFailedResponse::Keep, LoadFailedResponse::Delete]);
        assert_eq!(broken_responses(false), vec![BrokenResponse::DontReload, BrokenResponse::Reload]);
        assert_eq!(broken_responses(true), vec![BrokenResponse::Delete, BrokenResponse::DontReload, BrokenResponse::Reload]);
    }

    #[test]
    fn test_console_shell_respects_offered_responses() {
        let mut shell = ConsoleShell::new(BrokenPolicy::Delete, FailurePolicy::Delete);
        let broken = BrokenApplet { id: "a".to_string(), iid: "f::A".to_string(), name: "A".to_string(), can_delete: false };
        assert_eq!(shell.applet_broken(&broken), BrokenResponse::DontReload);
        assert_eq!(shell.applet_broken(&BrokenApplet { can_delete: true, ..broken }), BrokenResponse::Delete);

        let failure = LoadFailure {
            id: "a".to_string(),
            iid: "f::A".to_string(),
            name: "A".to_string(),
            reason: "no such factory".to_string(),
            locked_down: true,
        };
        assert_eq!(shell.loading_failed(&failure), LoadFailedResponse::Keep);
        assert!(!failure.message().contains("delete"));
        assert_eq!(shell.loading_failed(&LoadFailure { locked_down: false, ..failure }), LoadFailedResponse::Delete);
    }
}
