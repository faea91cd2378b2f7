use cafe_panel_applet::{names::APPLET_INTERFACE, proxy::AppletProxy, ChildProperty, ChildValue};
use futures::future::BoxFuture;
use zbus::{fdo::PropertiesProxy, names::InterfaceName};

use super::ContainerError;

/// Requests the panel sends to a live applet object.
pub trait AppletChannel: Send + Sync {
    fn get_property(&self, prop: ChildProperty) -> BoxFuture<'static, Result<ChildValue, ContainerError>>;
    fn set_property(&self, prop: ChildProperty, value: ChildValue) -> BoxFuture<'static, Result<(), ContainerError>>;
    fn popup_menu(&self, button: u32, time: u32) -> BoxFuture<'static, Result<(), ContainerError>>;
}

/// An applet object reached over the session bus.
#[derive(Clone)]
pub struct DBusAppletChannel {
    properties: PropertiesProxy<'static>,
    applet: AppletProxy<'static>,
}

impl DBusAppletChannel {
    pub fn new(properties: PropertiesProxy<'static>, applet: AppletProxy<'static>) -> Self {
        DBusAppletChannel { properties, applet }
    }
}

fn applet_interface() -> InterfaceName<'static> {
    InterfaceName::from_static_str_unchecked(APPLET_INTERFACE)
}

impl AppletChannel for DBusAppletChannel {
    fn get_property(&self, prop: ChildProperty) -> BoxFuture<'static, Result<ChildValue, ContainerError>> {
        let properties = self.properties.clone();
        Box::pin(async move {
            let value = properties.get(applet_interface(), prop.dbus_name()).await?;
            ChildValue::from_value(&value)
                .filter(|value| prop.accepts(value))
                .ok_or(ContainerError::InvalidChildValue { property: prop, expected: prop.type_name() })
        })
    }

    fn set_property(&self, prop: ChildProperty, value: ChildValue) -> BoxFuture<'static, Result<(), ContainerError>> {
        let properties = self.properties.clone();
        Box::pin(async move {
            properties.set(applet_interface(), prop.dbus_name(), &value.to_value()).await?;
            Ok(())
        })
    }

    fn popup_menu(&self, button: u32, time: u32) -> BoxFuture<'static, Result<(), ContainerError>> {
        let applet = self.applet.clone();
        Box::pin(async move {
            applet.popup_menu(button, time).await?;
            Ok(())
        })
    }
}
