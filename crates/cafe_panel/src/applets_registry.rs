//! Discovery of applet factories from `.cafe-panel-applet` descriptors.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use anyhow::Result;
use itertools::Itertools;
use tokio::sync::mpsc::UnboundedSender;

use crate::{
    applet_info::{AppletFactoryInfo, AppletInfo, Iid, DESCRIPTOR_SUFFIX},
    module_loader::AppletModule,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DescriptorEvent {
    Changed(PathBuf),
    Removed(PathBuf),
}

/// Runtime state of an in-process factory, kept across descriptor reloads.
#[derive(Default)]
pub struct FactoryRuntime {
    pub module: Option<Box<dyn AppletModule>>,
    pub n_applets: u32,
}

struct FactoryEntry {
    info: AppletFactoryInfo,
    runtime: FactoryRuntime,
}

pub struct AppletsRegistry {
    dirs: Vec<PathBuf>,
    factories: HashMap<String, FactoryEntry>,
    /// Modules of factories whose descriptor went away. Applets created by them may still be alive.
    orphaned_modules: Vec<Box<dyn AppletModule>>,
}

impl AppletsRegistry {
    /// Scan `dirs` in order. On conflicting factory ids the earlier directory wins.
    pub fn load(dirs: Vec<PathBuf>) -> Self {
        let factories = scan(&dirs)
            .into_iter()
            .map(|(id, info)| (id, FactoryEntry { info, runtime: FactoryRuntime::default() }))
            .collect();
        AppletsRegistry { dirs, factories, orphaned_modules: Vec::new() }
    }

    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    /// Apply a change in one of the watched directories. Returns whether the registry changed.
    pub fn handle_event(&mut self, event: &DescriptorEvent) -> bool {
        match event {
            DescriptorEvent::Changed(path) => self.descriptor_changed(path),
            DescriptorEvent::Removed(path) => self.descriptor_removed(path),
        }
    }

    fn descriptor_changed(&mut self, path: &Path) -> bool {
        if !is_descriptor(path) {
            return false;
        }
        let info = match AppletFactoryInfo::from_file(path) {
            Ok(info) => info,
            Err(e) => {
                log::warn!("{}", e);
                return false;
            }
        };

        // the descriptor may have been given a new factory id
        let renamed: Vec<String> = self
            .factories
            .values()
            .filter(|entry| entry.info.path == path && entry.info.id != info.id)
            .map(|entry| entry.info.id.clone())
            .collect();
        for id in &renamed {
            if let Some(entry) = self.factories.remove(id) {
                log::info!("Applet factory {} in {} is now called {}", id, path.display(), info.id);
                self.orphaned_modules.extend(entry.runtime.module);
            }
        }
        if !renamed.is_empty() {
            self.adopt_unprovided();
        }

        let replaced = match self.factories.get_mut(&info.id) {
            Some(entry) => {
                let replaces = entry.info.srcdir == info.srcdir || Self::precedes(&self.dirs, &info.srcdir, &entry.info.srcdir);
                if replaces {
                    log::info!("Reloaded applet factory {} from {}", info.id, path.display());
                    entry.info = info;
                } else {
                    log::debug!(
                        "Ignoring {}: factory {} is already provided by {}",
                        path.display(),
                        info.id,
                        entry.info.path.display()
                    );
                }
                replaces
            }
            None => {
                log::info!("Found applet factory {} in {}", info.id, path.display());
                self.factories.insert(info.id.clone(), FactoryEntry { info, runtime: FactoryRuntime::default() });
                true
            }
        };
        replaced || !renamed.is_empty()
    }

    fn descriptor_removed(&mut self, path: &Path) -> bool {
        let Some(id) = self.factories.values().find(|entry| entry.info.path == path).map(|entry| entry.info.id.clone()) else {
            return false;
        };
        if let Some(entry) = self.factories.remove(&id) {
            log::info!("Applet factory {} was removed", id);
            self.orphaned_modules.extend(entry.runtime.module);
        }

        self.adopt_unprovided();
        true
    }

    /// Let lower precedence descriptors take over ids nobody provides anymore.
    fn adopt_unprovided(&mut self) {
        for (id, info) in scan(&self.dirs) {
            if !self.factories.contains_key(&id) {
                log::info!("Applet factory {} is now provided by {}", id, info.path.display());
                self.factories.insert(id, FactoryEntry { info, runtime: FactoryRuntime::default() });
            }
        }
    }

    fn precedes(dirs: &[PathBuf], dir: &Path, other: &Path) -> bool {
        let index = |dir: &Path| dirs.iter().position(|d| d == dir).unwrap_or(usize::MAX);
        index(dir) < index(other)
    }

    /// All known applets, ordered by factory id.
    pub fn get_applets(&self) -> Vec<&AppletInfo> {
        self.factories
            .values()
            .sorted_by(|a, b| a.info.id.cmp(&b.info.id))
            .flat_map(|entry| entry.info.applets.iter())
            .collect()
    }

    pub fn get_factory(&self, iid: &str) -> Option<&AppletFactoryInfo> {
        let iid: Iid = iid.parse().ok()?;
        self.factories.get(&iid.factory_id).map(|entry| &entry.info)
    }

    pub fn get_applet_info(&self, iid: &str) -> Option<&AppletInfo> {
        self.get_factory(iid)?.applet(iid)
    }

    pub fn get_applet_info_from_old_id(&self, old_id: &str) -> Option<&AppletInfo> {
        self.factories.values().find_map(|entry| entry.info.applet_from_old_id(old_id))
    }

    pub fn module(&self, iid: &str) -> Option<&dyn AppletModule> {
        let iid: Iid = iid.parse().ok()?;
        self.factories.get(&iid.factory_id)?.runtime.module.as_deref()
    }

    pub fn factory_runtime(&mut self, iid: &str) -> Option<(&AppletFactoryInfo, &mut FactoryRuntime)> {
        let iid: Iid = iid.parse().ok()?;
        self.factories.get_mut(&iid.factory_id).map(|entry| (&entry.info, &mut entry.runtime))
    }
}

fn is_descriptor(path: &Path) -> bool {
    path.file_name().and_then(|name| name.to_str()).map_or(false, |name| name.ends_with(DESCRIPTOR_SUFFIX))
}

/// Parse every descriptor in `dirs`, keeping the first one found for each factory id.
fn scan(dirs: &[PathBuf]) -> HashMap<String, AppletFactoryInfo> {
    let mut found: HashMap<String, AppletFactoryInfo> = HashMap::new();
    for dir in dirs {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                log::debug!("Skipping applet directory {}: {}", dir.display(), e);
                continue;
            }
        };
        let paths = entries.filter_map(|entry| entry.ok()).map(|entry| entry.path()).filter(|path| is_descriptor(path)).sorted();
        for path in paths {
            match AppletFactoryInfo::from_file(&path) {
                Ok(info) if found.contains_key(&info.id) => {
                    log::debug!("Factory {} in {} is overridden by an earlier directory", info.id, path.display());
                }
                Ok(info) => {
                    found.insert(info.id.clone(), info);
                }
                Err(e) => log::warn!("{}", e),
            }
        }
    }
    found
}

/// Watch the descriptor directories, forwarding changes of descriptor files.
pub async fn run_descriptor_watch(dirs: Vec<PathBuf>, evt_send: UnboundedSender<DescriptorEvent>) -> Result<()> {
    use notify::{event::ModifyKind, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut watcher: RecommendedWatcher = Watcher::new(
        move |res: notify::Result<notify::Event>| match res {
            Ok(notify::Event { kind, paths, .. }) => {
                let event: fn(PathBuf) -> DescriptorEvent = match kind {
                    EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_)) => |path: PathBuf| {
                        if path.exists() {
                            DescriptorEvent::Changed(path)
                        } else {
                            DescriptorEvent::Removed(path)
                        }
                    },
                    EventKind::Create(_) | EventKind::Modify(_) => DescriptorEvent::Changed,
                    _ => return,
                };
                for path in paths.into_iter().filter(|path| is_descriptor(path)) {
                    if let Err(err) = tx.send(event(path)) {
                        log::warn!("Error forwarding descriptor event: {:?}", err);
                    }
                }
            }
            Err(e) => log::error!("Encountered Error While Watching Applet Directories: {}", e),
        },
        notify::Config::default(),
    )?;
    for dir in &dirs {
        if let Err(e) = watcher.watch(dir, RecursiveMode::NonRecursive) {
            log::debug!("Not watching {}: {}", dir.display(), e);
        }
    }

    crate::loop_select_until_shutdown! {
        Some(event) = rx.recv() => {
            // editors sometimes truncate before writing
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            evt_send.send(event)?;
        },
        else => break
    };
    Ok(())
}
