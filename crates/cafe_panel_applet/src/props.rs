use std::collections::HashMap;

use zbus::zvariant::{OwnedValue, Value};

use crate::{AppletFlags, Error, Orientation, Result, SizeHints};

/// The fixed set of applet properties the panel can read and write.
///
/// Each has a logical name (`size-hints`), used in `GetApplet` construction properties and by the
/// panel, and a D-Bus property name (`SizeHints`) on the applet object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChildProperty {
    PrefsPath,
    Orient,
    Size,
    SizeHints,
    Background,
    Flags,
    Locked,
    LockedDown,
}

impl ChildProperty {
    pub const ALL: [ChildProperty; 8] = [
        ChildProperty::PrefsPath,
        ChildProperty::Orient,
        ChildProperty::Size,
        ChildProperty::SizeHints,
        ChildProperty::Background,
        ChildProperty::Flags,
        ChildProperty::Locked,
        ChildProperty::LockedDown,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ChildProperty::PrefsPath => "prefs-path",
            ChildProperty::Orient => "orient",
            ChildProperty::Size => "size",
            ChildProperty::SizeHints => "size-hints",
            ChildProperty::Background => "background",
            ChildProperty::Flags => "flags",
            ChildProperty::Locked => "locked",
            ChildProperty::LockedDown => "locked-down",
        }
    }

    pub fn dbus_name(self) -> &'static str {
        match self {
            ChildProperty::PrefsPath => "PrefsPath",
            ChildProperty::Orient => "Orient",
            ChildProperty::Size => "Size",
            ChildProperty::SizeHints => "SizeHints",
            ChildProperty::Background => "Background",
            ChildProperty::Flags => "Flags",
            ChildProperty::Locked => "Locked",
            ChildProperty::LockedDown => "LockedDown",
        }
    }

    pub fn from_dbus_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|prop| prop.dbus_name() == name)
    }

    /// Human readable name of the value type this property holds.
    pub fn type_name(self) -> &'static str {
        match self {
            ChildProperty::PrefsPath | ChildProperty::Background => "string",
            ChildProperty::Orient | ChildProperty::Size | ChildProperty::Flags => "uint32",
            ChildProperty::SizeHints => "int32 array",
            ChildProperty::Locked | ChildProperty::LockedDown => "boolean",
        }
    }

    pub fn accepts(self, value: &ChildValue) -> bool {
        matches!(
            (self, value),
            (ChildProperty::PrefsPath | ChildProperty::Background, ChildValue::Str(_))
                | (ChildProperty::Orient | ChildProperty::Size | ChildProperty::Flags, ChildValue::U32(_))
                | (ChildProperty::SizeHints, ChildValue::IntArray(_))
                | (ChildProperty::Locked | ChildProperty::LockedDown, ChildValue::Bool(_))
        )
    }
}

impl std::str::FromStr for ChildProperty {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL.into_iter().find(|prop| prop.name() == s).ok_or_else(|| Error::UnknownProperty(s.to_string()))
    }
}

impl std::fmt::Display for ChildProperty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Value of a [`ChildProperty`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildValue {
    Str(String),
    U32(u32),
    Bool(bool),
    IntArray(Vec<i32>),
}

impl ChildValue {
    pub fn to_value(&self) -> Value<'static> {
        match self {
            ChildValue::Str(s) => Value::from(s.clone()),
            ChildValue::U32(n) => Value::from(*n),
            ChildValue::Bool(b) => Value::from(*b),
            ChildValue::IntArray(values) => Value::from(values.clone()),
        }
    }

    pub fn from_value(value: &Value<'_>) -> Option<Self> {
        match value {
            Value::Str(s) => Some(ChildValue::Str(s.as_str().to_string())),
            Value::U32(n) => Some(ChildValue::U32(*n)),
            Value::Bool(b) => Some(ChildValue::Bool(*b)),
            Value::Array(array) => array
                .get()
                .iter()
                .map(|elem| match elem {
                    Value::I32(n) => Some(*n),
                    _ => None,
                })
                .collect::<Option<Vec<i32>>>()
                .map(ChildValue::IntArray),
            Value::Value(inner) => Self::from_value(inner),
            _ => None,
        }
    }
}

/// Construction properties passed along with `GetApplet`.
///
/// Every field is optional; applets fall back to their defaults for missing ones.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AppletProps {
    pub prefs_path: Option<String>,
    pub orient: Option<Orientation>,
    pub size: Option<u32>,
    pub size_hints: Option<SizeHints>,
    pub background: Option<String>,
    pub flags: Option<AppletFlags>,
    pub locked: Option<bool>,
    pub locked_down: Option<bool>,
}

impl AppletProps {
    /// Validate a `a{sv}` dictionary, rejecting unknown keys and values of the wrong type.
    pub fn from_dict(dict: &HashMap<String, OwnedValue>) -> Result<Self> {
        let mut props = AppletProps::default();
        for (key, value) in dict {
            let prop: ChildProperty = key.parse()?;
            let value = ChildValue::from_value(value)
                .filter(|v| prop.accepts(v))
                .ok_or(Error::PropertyType { property: prop.name(), expected: prop.type_name() })?;
            props.set(prop, value)?;
        }
        Ok(props)
    }

    /// Set a single property from an already type-checked value.
    pub fn set(&mut self, prop: ChildProperty, value: ChildValue) -> Result<()> {
        let type_error = || Error::PropertyType { property: prop.name(), expected: prop.type_name() };
        match (prop, value) {
            (ChildProperty::PrefsPath, ChildValue::Str(s)) => self.prefs_path = Some(s),
            (ChildProperty::Background, ChildValue::Str(s)) => self.background = Some(s),
            (ChildProperty::Orient, ChildValue::U32(n)) => self.orient = Some(Orientation::from_u32(n)?),
            (ChildProperty::Size, ChildValue::U32(n)) => self.size = Some(n),
            (ChildProperty::Flags, ChildValue::U32(n)) => self.flags = Some(AppletFlags::from_bits_truncate(n)),
            (ChildProperty::SizeHints, ChildValue::IntArray(hints)) => self.size_hints = Some(SizeHints::new(hints)?),
            (ChildProperty::Locked, ChildValue::Bool(b)) => self.locked = Some(b),
            (ChildProperty::LockedDown, ChildValue::Bool(b)) => self.locked_down = Some(b),
            _ => return Err(type_error()),
        }
        Ok(())
    }

    /// The properties that are set, as typed pairs.
    pub fn entries(&self) -> Vec<(ChildProperty, ChildValue)> {
        let mut entries = Vec::new();
        if let Some(path) = &self.prefs_path {
            entries.push((ChildProperty::PrefsPath, ChildValue::Str(path.clone())));
        }
        if let Some(orient) = self.orient {
            entries.push((ChildProperty::Orient, ChildValue::U32(orient.as_u32())));
        }
        if let Some(size) = self.size {
            entries.push((ChildProperty::Size, ChildValue::U32(size)));
        }
        if let Some(hints) = &self.size_hints {
            entries.push((ChildProperty::SizeHints, ChildValue::IntArray(hints.as_slice().to_vec())));
        }
        if let Some(background) = &self.background {
            entries.push((ChildProperty::Background, ChildValue::Str(background.clone())));
        }
        if let Some(flags) = self.flags {
            entries.push((ChildProperty::Flags, ChildValue::U32(flags.bits())));
        }
        if let Some(locked) = self.locked {
            entries.push((ChildProperty::Locked, ChildValue::Bool(locked)));
        }
        if let Some(locked_down) = self.locked_down {
            entries.push((ChildProperty::LockedDown, ChildValue::Bool(locked_down)));
        }
        entries
    }

    /// Encode as the `a{sv}` dictionary sent to the factory.
    pub fn to_dict(&self) -> HashMap<&'static str, Value<'static>> {
        self.entries().into_iter().map(|(prop, value)| (prop.name(), value.to_value())).collect()
    }
}
