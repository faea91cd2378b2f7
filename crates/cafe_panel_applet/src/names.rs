//! Bus names, object paths and interface names of the applet hosting protocol.
//!
//! A factory with id `ClockAppletFactory` owns `org.cafe.panel.applet.ClockAppletFactory` and
//! serves `org.cafe.panel.applet.AppletFactory` at `/org/cafe/panel/applet/ClockAppletFactory`.
//! Every applet it creates lives at `/org/cafe/panel/applet/<applet_id>/<uid>`.

pub const FACTORY_INTERFACE: &str = "org.cafe.panel.applet.AppletFactory";
pub const APPLET_INTERFACE: &str = "org.cafe.panel.applet.Applet";

const BUS_NAME_PREFIX: &str = "org.cafe.panel.applet";
const OBJECT_PATH_PREFIX: &str = "/org/cafe/panel/applet";

pub fn factory_bus_name(factory_id: &str) -> String {
    format!("{}.{}", BUS_NAME_PREFIX, factory_id)
}

pub fn factory_object_path(factory_id: &str) -> String {
    format!("{}/{}", OBJECT_PATH_PREFIX, path_element(factory_id))
}

pub fn applet_object_path(applet_id: &str, uid: u32) -> String {
    format!("{}/{}/{}", OBJECT_PATH_PREFIX, path_element(applet_id), uid)
}

/// Object path elements may only contain `[A-Za-z0-9_]`.
fn path_element(s: &str) -> String {
    s.chars().map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' }).collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_names() {
        assert_eq!(factory_bus_name("ClockAppletFactory"), "org.cafe.panel.applet.ClockAppletFactory");
        assert_eq!(factory_object_path("ClockAppletFactory"), "/org/cafe/panel/applet/ClockAppletFactory");
        assert_eq!(applet_object_path("ClockApplet", 3), "/org/cafe/panel/applet/ClockApplet/3");
        assert_eq!(applet_object_path("net-speed.applet", 0), "/org/cafe/panel/applet/net_speed_applet/0");
    }
}
