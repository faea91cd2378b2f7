use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    str::FromStr,
};

use cafe_panel_applet::Platform;
use freedesktop_desktop_entry::DesktopEntry;
use itertools::Itertools;

pub const DESCRIPTOR_SUFFIX: &str = ".cafe-panel-applet";
const FACTORY_GROUP: &str = "Applet Factory";

#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    #[error("Failed to read {}: {}", .0.display(), .1)]
    Io(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse {}: {}", .0.display(), .1)]
    Decode(PathBuf, String),
    #[error("{} has no [Applet Factory] group", .0.display())]
    MissingFactoryGroup(PathBuf),
    #[error("{} does not set the factory Id", .0.display())]
    MissingId(PathBuf),
    #[error("{} is an in-process factory without a Location", .0.display())]
    MissingLocation(PathBuf),
    #[error("{} does not describe any applet", .0.display())]
    NoApplets(PathBuf),
    #[error("{}: invalid boolean {value:?} for {key}", .path.display())]
    InvalidBoolean { path: PathBuf, key: &'static str, value: String },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("Invalid applet iid {0:?}, expected <factory_id>::<applet_id>")]
pub struct InvalidIid(pub String);

/// Applet identifier of the form `<factory_id>::<applet_id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Iid {
    pub factory_id: String,
    pub applet_id: String,
}

impl FromStr for Iid {
    type Err = InvalidIid;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once("::") {
            Some((factory_id, applet_id)) if !factory_id.is_empty() && !applet_id.is_empty() => {
                Ok(Iid { factory_id: factory_id.to_string(), applet_id: applet_id.to_string() })
            }
            _ => Err(InvalidIid(s.to_string())),
        }
    }
}

impl std::fmt::Display for Iid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}::{}", self.factory_id, self.applet_id)
    }
}

/// One applet a factory can create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppletInfo {
    pub iid: String,
    pub name: String,
    pub description: String,
    pub icon: Option<String>,
    /// Ids the applet was known by in the CafeComponent days.
    pub old_ids: Vec<String>,
    pub x11_supported: bool,
    pub wayland_supported: bool,
}

impl AppletInfo {
    pub fn supports(&self, platform: Platform) -> bool {
        match platform {
            Platform::X11 => self.x11_supported,
            Platform::Wayland => self.wayland_supported,
        }
    }
}

/// A parsed `.cafe-panel-applet` descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppletFactoryInfo {
    pub id: String,
    pub in_process: bool,
    /// Shared library of an in-process factory.
    pub location: Option<PathBuf>,
    /// Directory the descriptor was found in.
    pub srcdir: PathBuf,
    pub path: PathBuf,
    pub applets: Vec<AppletInfo>,
    pub has_old_ids: bool,
}

impl AppletFactoryInfo {
    /// Read and parse a descriptor file, using the process locale and library prefix.
    pub fn from_file(path: &Path) -> Result<Self, DescriptorError> {
        let contents = std::fs::read_to_string(path).map_err(|e| DescriptorError::Io(path.to_path_buf(), e))?;
        let lib_prefix = std::env::var("CAFE_PANEL_APPLET_LIB_PREFIX").ok().filter(|prefix| !prefix.is_empty());
        Self::parse(path, &contents, lib_prefix.as_deref(), &process_locales())
    }

    pub fn parse(path: &Path, contents: &str, lib_prefix: Option<&str>, locales: &[String]) -> Result<Self, DescriptorError> {
        let entry = DesktopEntry::decode(path, contents).map_err(|e| DescriptorError::Decode(path.to_path_buf(), e.to_string()))?;
        let factory_group =
            entry.groups.get(FACTORY_GROUP).ok_or_else(|| DescriptorError::MissingFactoryGroup(path.to_path_buf()))?;

        let id = factory_group
            .get("Id")
            .map(|(value, _)| unescape(value))
            .filter(|id| !id.is_empty())
            .ok_or_else(|| DescriptorError::MissingId(path.to_path_buf()))?;

        let in_process = match factory_group.get("InProcess") {
            Some((value, _)) => parse_bool(value).ok_or_else(|| DescriptorError::InvalidBoolean {
                path: path.to_path_buf(),
                key: "InProcess",
                value: value.to_string(),
            })?,
            None => false,
        };

        let location = match factory_group.get("Location").map(|(value, _)| unescape(value)) {
            Some(location) if in_process => Some(PathBuf::from(format!("{}{}", lib_prefix.unwrap_or_default(), location))),
            None if in_process => return Err(DescriptorError::MissingLocation(path.to_path_buf())),
            _ => None,
        };

        let applets: Vec<AppletInfo> = entry
            .groups
            .iter()
            .filter(|(group, _)| **group != FACTORY_GROUP)
            .map(|(applet_id, keys)| applet_info(path, &id, applet_id, keys, locales))
            .collect();
        if applets.is_empty() {
            return Err(DescriptorError::NoApplets(path.to_path_buf()));
        }

        Ok(AppletFactoryInfo {
            has_old_ids: applets.iter().any(|applet| !applet.old_ids.is_empty()),
            id,
            in_process,
            location,
            srcdir: path.parent().map(Path::to_path_buf).unwrap_or_default(),
            path: path.to_path_buf(),
            applets,
        })
    }

    pub fn applet(&self, iid: &str) -> Option<&AppletInfo> {
        self.applets.iter().find(|applet| applet.iid == iid)
    }

    pub fn applet_from_old_id(&self, old_id: &str) -> Option<&AppletInfo> {
        if !self.has_old_ids {
            return None;
        }
        self.applets.iter().find(|applet| applet.old_ids.iter().any(|id| id == old_id))
    }
}

type KeyMap<'a> = BTreeMap<&'a str, (&'a str, BTreeMap<&'a str, &'a str>)>;

fn applet_info(path: &Path, factory_id: &str, applet_id: &str, keys: &KeyMap<'_>, locales: &[String]) -> AppletInfo {
    let localized = |key: &str| {
        keys.get(key).map(|(default, translations)| {
            let value = locales.iter().find_map(|locale| translations.get(locale.as_str())).unwrap_or(default);
            unescape(value)
        })
    };
    let list = |key: &str| keys.get(key).map(|(value, _)| parse_list(value));

    let (x11_supported, wayland_supported) = match list("Platforms") {
        None => (true, true),
        Some(platforms) => {
            for unknown in platforms.iter().filter(|p| *p != "X11" && *p != "Wayland") {
                log::warn!("{}: unknown platform {:?} for applet {}", path.display(), unknown, applet_id);
            }
            (platforms.iter().any(|p| p == "X11"), platforms.iter().any(|p| p == "Wayland"))
        }
    };

    AppletInfo {
        iid: format!("{}::{}", factory_id, applet_id),
        name: localized("Name").unwrap_or_else(|| applet_id.to_string()),
        description: localized("Description").unwrap_or_default(),
        icon: keys.get("Icon").map(|(value, _)| unescape(value)).filter(|icon| !icon.is_empty()),
        old_ids: list("CafeComponentId").unwrap_or_default(),
        x11_supported,
        wayland_supported,
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

/// Split a `;` separated key-file list, honouring `\;` escapes.
fn parse_list(value: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(';') => current.push(';'),
                Some(other) => {
                    current.push('\\');
                    current.push(other);
                }
                None => current.push('\\'),
            },
            ';' => items.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    items.push(current);
    items.into_iter().map(|item| unescape(&item)).filter(|item| !item.is_empty()).collect()
}

fn unescape(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            result.push(c);
            continue;
        }
        match chars.next() {
            Some('s') => result.push(' '),
            Some('n') => result.push('\n'),
            Some('t') => result.push('\t'),
            Some('r') => result.push('\r'),
            Some(other) => result.push(other),
            None => result.push('\\'),
        }
    }
    result
}

/// Locale names to look translated keys up with, most preferred first.
pub fn process_locales() -> Vec<String> {
    let var = |name: &str| std::env::var(name).ok().filter(|value| !value.is_empty());
    let mut locales: Vec<String> = var("LANGUAGE").map(|v| v.split(':').map(str::to_string).collect()).unwrap_or_default();
    if let Some(locale) = var("LC_ALL").or_else(|| var("LC_MESSAGES")).or_else(|| var("LANG")) {
        locales.push(locale);
    }
    locales.iter().flat_map(|locale| locale_variants(locale)).filter(|l| l != "C" && l != "POSIX").unique().collect()
}

/// `de_DE.UTF-8@euro` expands to `de_DE@euro`, `de_DE`, `de@euro` and `de`.
fn locale_variants(locale: &str) -> Vec<String> {
    let (locale, modifier) = match locale.split_once('@') {
        Some((locale, modifier)) => (locale, Some(modifier)),
        None => (locale, None),
    };
    let locale = locale.split_once('.').map(|(locale, _)| locale).unwrap_or(locale);
    let language = locale.split_once('_').map(|(language, _)| language).unwrap_or(locale);

    let mut variants = Vec::new();
    if let Some(modifier) = modifier {
        variants.push(format!("{}@{}", locale, modifier));
    }
    variants.push(locale.to_string());
    if language != locale {
        if let Some(modifier) = modifier {
            variants.push(format!("{}@{}", language, modifier));
        }
        variants.push(language.to_string());
    }
    variants
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(contents: &str) -> Result<AppletFactoryInfo, DescriptorError> {
        AppletFactoryInfo::parse(Path::new("/usr/share/cafe-panel/applets/org.cafe.clock.cafe-panel-applet"), contents, None, &[])
    }

    #[test]
    fn test_iid() {
        let iid: Iid = "ClockAppletFactory::ClockApplet".parse().unwrap();
        assert_eq!(iid.factory_id, "ClockAppletFactory");
        assert_eq!(iid.applet_id, "ClockApplet");
        assert_eq!(iid.to_string(), "ClockAppletFactory::ClockApplet");
        assert!("ClockApplet".parse::<Iid>().is_err());
        assert!("::ClockApplet".parse::<Iid>().is_err());
    }

    #[test]
    fn test_clock_descriptor() {
        let info = parse("[Applet Factory]\nId=clock\nInProcess=false\n\n[ClockApplet]\nName=Clock\n").unwrap();
        assert_eq!(info.id, "clock");
        assert!(!info.in_process);
        assert_eq!(info.location, None);
        assert_eq!(info.srcdir, PathBuf::from("/usr/share/cafe-panel/applets"));
        assert_eq!(info.applets.len(), 1);
        let applet = &info.applets[0];
        assert_eq!(applet.iid, "clock::ClockApplet");
        assert!(applet.x11_supported);
        assert!(applet.wayland_supported);
    }

    #[test]
    fn test_rejected_descriptors() {
        assert!(matches!(parse("[Applet Factory]\nInProcess=false\n[ClockApplet]\nName=Clock\n"), Err(DescriptorError::MissingId(_))));
        assert!(matches!(parse("[Applet Factory]\nId=clock\n"), Err(DescriptorError::NoApplets(_))));
        assert!(matches!(
            parse("[Applet Factory]\nId=clock\nInProcess=true\n[ClockApplet]\nName=Clock\n"),
            Err(DescriptorError::MissingLocation(_))
        ));
        assert!(matches!(
            parse("[Applet Factory]\nId=clock\nInProcess=maybe\n[ClockApplet]\n"),
            Err(DescriptorError::InvalidBoolean { key: "InProcess", .. })
        ));
    }

    #[test]
    fn test_in_process_descriptor_with_prefix() {
        let contents = "[Applet Factory]\nId=NotificationAreaAppletFactory\nInProcess=true\nLocation=/usr/lib/libnotification-area.so\n\n\
                        [NotificationArea]\nName=Notification Area\nPlatforms=X11;\nCafeComponentId=OAFIID:CAFE_NotificationAreaApplet;\n";
        let path = Path::new("/opt/applets/notification-area.cafe-panel-applet");
        let info = AppletFactoryInfo::parse(path, contents, Some("/staging"), &[]).unwrap();
        assert_eq!(info.location, Some(PathBuf::from("/staging/usr/lib/libnotification-area.so")));
        assert!(info.has_old_ids);
        let applet = info.applet_from_old_id("OAFIID:CAFE_NotificationAreaApplet").unwrap();
        assert_eq!(applet.iid, "NotificationAreaAppletFactory::NotificationArea");
        assert!(applet.x11_supported);
        assert!(!applet.wayland_supported);
    }

    #[test]
    fn test_localized_names() {
        let contents = "[Applet Factory]\nId=clock\n[ClockApplet]\nName=Clock\nName[de]=Uhr\nDescription=Get the time\n";
        let info = AppletFactoryInfo::parse(Path::new("/a/clock.cafe-panel-applet"), contents, None, &locale_variants("de_AT.UTF-8"))
            .unwrap();
        assert_eq!(info.applets[0].name, "Uhr");
        assert_eq!(info.applets[0].description, "Get the time");
    }

    #[test]
    fn test_locale_variants() {
        assert_eq!(locale_variants("de_DE.UTF-8@euro"), vec!["de_DE@euro", "de_DE", "de@euro", "de"]);
        assert_eq!(locale_variants("fr"), vec!["fr"]);
    }

    #[test]
    fn test_parse_list() {
        assert_eq!(parse_list("X11;Wayland;"), vec!["X11", "Wayland"]);
        assert_eq!(parse_list(r"a\;b;c"), vec!["a;b", "c"]);
        assert_eq!(parse_list(""), Vec::<String>::new());
    }
}
