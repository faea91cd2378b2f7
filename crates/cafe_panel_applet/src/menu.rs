use std::sync::Arc;

use crate::Applet;

pub const REMOVE_ACTION: &str = "remove";
pub const MOVE_ACTION: &str = "move";
pub const LOCK_ACTION: &str = "lock";

pub type ActionCallback = Arc<dyn Fn(&Applet) + Send + Sync>;

/// An applet supplied context menu entry.
#[derive(Clone)]
pub struct MenuAction {
    pub name: String,
    pub label: String,
    pub callback: ActionCallback,
}

impl MenuAction {
    pub fn new(name: impl Into<String>, label: impl Into<String>, callback: impl Fn(&Applet) + Send + Sync + 'static) -> Self {
        MenuAction { name: name.into(), label: label.into(), callback: Arc::new(callback) }
    }
}

impl std::fmt::Debug for MenuAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MenuAction").field("name", &self.name).field("label", &self.label).finish_non_exhaustive()
    }
}

/// A single entry of the context menu, as handed to a [`MenuPresenter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MenuItem {
    pub action: String,
    pub label: String,
    pub sensitive: bool,
    pub visible: bool,
    /// Check state for toggle entries.
    pub toggled: Option<bool>,
}

/// Shows the context menu of an applet. Rendering is up to the toolkit the applet is written with.
pub trait MenuPresenter: Send + Sync {
    fn popup(&self, applet: &Applet, items: &[MenuItem], button: u32, time: u32);
}

/// Presenter that only logs the menu it was asked to show.
#[derive(Debug, Default)]
pub struct LogMenuPresenter;

impl MenuPresenter for LogMenuPresenter {
    fn popup(&self, applet: &Applet, items: &[MenuItem], button: u32, time: u32) {
        let shown: Vec<&str> = items.iter().filter(|item| item.visible).map(|item| item.action.as_str()).collect();
        log::info!("Context menu of {} (uid {}) requested with button {} at {}: {:?}", applet.id(), applet.uid(), button, time, shown);
    }
}

/// The applet's actions merged with the panel's remove, move and lock actions.
#[derive(Debug, Clone, Default)]
pub struct AppletMenu {
    actions: Vec<MenuAction>,
}

impl AppletMenu {
    pub fn set_actions(&mut self, actions: Vec<MenuAction>) {
        self.actions = actions;
    }

    pub fn action(&self, name: &str) -> Option<&MenuAction> {
        self.actions.iter().find(|action| action.name == name)
    }

    pub fn items(&self, locked: bool, locked_down: bool) -> Vec<MenuItem> {
        let mut items: Vec<MenuItem> = self
            .actions
            .iter()
            .map(|action| MenuItem {
                action: action.name.clone(),
                label: action.label.clone(),
                sensitive: true,
                visible: true,
                toggled: None,
            })
            .collect();
        items.extend(panel_items(locked, locked_down));
        items
    }
}

fn panel_items(locked: bool, locked_down: bool) -> [MenuItem; 3] {
    [
        MenuItem {
            action: REMOVE_ACTION.to_string(),
            label: "Remove From Panel".to_string(),
            sensitive: !locked,
            visible: !locked_down,
            toggled: None,
        },
        MenuItem {
            action: MOVE_ACTION.to_string(),
            label: "Move".to_string(),
            sensitive: !locked,
            visible: !locked_down,
            toggled: None,
        },
        MenuItem {
            action: LOCK_ACTION.to_string(),
            label: "Lock To Panel".to_string(),
            sensitive: true,
            visible: !locked_down,
            toggled: Some(locked),
        },
    ]
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn find<'a>(items: &'a [MenuItem], action: &str) -> &'a MenuItem {
        items.iter().find(|item| item.action == action).unwrap()
    }

    #[test]
    fn test_unlocked_menu() {
        let mut menu = AppletMenu::default();
        menu.set_actions(vec![MenuAction::new("prefs", "Preferences", |_| {})]);
        let items = menu.items(false, false);
        assert_eq!(items.iter().map(|i| i.action.as_str()).collect::<Vec<_>>(), vec!["prefs", "remove", "move", "lock"]);
        assert!(items.iter().all(|item| item.sensitive && item.visible));
        assert_eq!(find(&items, "lock").toggled, Some(false));
    }

    #[test]
    fn test_locked_menu() {
        let items = AppletMenu::default().items(true, false);
        assert!(!find(&items, "remove").sensitive);
        assert!(!find(&items, "move").sensitive);
        assert!(find(&items, "lock").sensitive);
        assert_eq!(find(&items, "lock").toggled, Some(true));
    }

    #[test]
    fn test_locked_down_menu() {
        let items = AppletMenu::default().items(false, true);
        for action in [REMOVE_ACTION, MOVE_ACTION, LOCK_ACTION] {
            assert!(!find(&items, action).visible);
        }
    }
}
