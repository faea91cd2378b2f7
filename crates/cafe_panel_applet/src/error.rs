use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Dbus connection error")]
    DbusError(#[from] zbus::Error),
    #[error("Unknown applet property {0:?}")]
    UnknownProperty(String),
    #[error("Applet property {property} expects a value of type {expected}")]
    PropertyType { property: &'static str, expected: &'static str },
    #[error("Invalid orientation {0}")]
    InvalidOrientation(u32),
    #[error("Couldn't parse orientation {0:?}. Possible values are up, down, left, right")]
    InvalidOrientationName(String),
    #[error("Size hints must come in (max, min) pairs, got {0} elements")]
    OddSizeHints(usize),
    #[error("Factory {0} already owns its bus name in another process")]
    FactoryRunning(String),
    #[error("Factory {factory_id} has no applet with uid {uid}")]
    UnknownApplet { factory_id: String, uid: u32 },
    #[error("Factory {0} ran out of applet uids")]
    UidsExhausted(String),
    #[error("In-process factory thread failed: {0}")]
    FactoryThread(String),
    #[error("Could not create plug window: {0}")]
    Plug(String),
}

pub type Result<T> = std::result::Result<T, Error>;
