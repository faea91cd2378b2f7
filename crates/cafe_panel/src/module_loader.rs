//! Loading of in-process applet factories from shared libraries.

use std::{
    ffi::{c_char, c_int, c_uint, c_void, CStr, CString},
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
};

use cafe_panel_applet::shlib::WidgetPtr;

const FACTORY_SYMBOL: &str = "_cafe_panel_applet_shlib_factory";
const WIDGET_SYMBOL: &str = "cafe_panel_applet_get_applet_widget";

#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    #[error("Failed to open {}: {}", .path.display(), .reason)]
    Open { path: PathBuf, reason: String },
    #[error("{} does not export {}", .path.display(), .symbol)]
    MissingSymbol { path: PathBuf, symbol: &'static str },
    #[error("Factory entry point of {} failed with code {}", .path.display(), .code)]
    EntryPointFailed { path: PathBuf, code: i32 },
}

/// A loaded in-process factory module.
pub trait AppletModule: Send {
    /// Call the module's factory entry point.
    fn activate(&self) -> Result<(), ModuleError>;
    fn applet_widget(&self, factory_id: &str, uid: u32) -> Option<WidgetPtr>;
}

pub trait ModuleLoader: Send {
    fn load(&self, location: &Path) -> Result<Box<dyn AppletModule>, ModuleError>;
}

type FactoryFn = unsafe extern "C" fn() -> c_int;
type WidgetFn = unsafe extern "C" fn(*const c_char, c_uint) -> *mut c_void;

/// Opens modules with `dlopen`.
#[derive(Debug, Default)]
pub struct DlModuleLoader;

pub struct DlModule {
    path: PathBuf,
    handle: *mut c_void,
    factory: FactoryFn,
    get_widget: WidgetFn,
}

// The handle is only used from the panel's event loop thread.
unsafe impl Send for DlModule {}

impl ModuleLoader for DlModuleLoader {
    fn load(&self, location: &Path) -> Result<Box<dyn AppletModule>, ModuleError> {
        let open_error = |reason: String| ModuleError::Open { path: location.to_path_buf(), reason };
        let c_path = CString::new(location.as_os_str().as_bytes()).map_err(|e| open_error(e.to_string()))?;

        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
        if handle.is_null() {
            return Err(open_error(last_dl_error()));
        }

        let lookup = |symbol: &'static str| {
            let name = CString::new(symbol).map_err(|e| open_error(e.to_string()))?;
            let ptr = unsafe { libc::dlsym(handle, name.as_ptr()) };
            if ptr.is_null() {
                Err(ModuleError::MissingSymbol { path: location.to_path_buf(), symbol })
            } else {
                Ok(ptr)
            }
        };
        let symbols = lookup(FACTORY_SYMBOL).and_then(|factory| Ok((factory, lookup(WIDGET_SYMBOL)?)));
        match symbols {
            Ok((factory, get_widget)) => Ok(Box::new(DlModule {
                path: location.to_path_buf(),
                handle,
                factory: unsafe { std::mem::transmute::<*mut c_void, FactoryFn>(factory) },
                get_widget: unsafe { std::mem::transmute::<*mut c_void, WidgetFn>(get_widget) },
            })),
            Err(e) => {
                unsafe { libc::dlclose(handle) };
                Err(e)
            }
        }
    }
}

impl AppletModule for DlModule {
    fn activate(&self) -> Result<(), ModuleError> {
        log::debug!("Calling {} of {}", FACTORY_SYMBOL, self.path.display());
        match unsafe { (self.factory)() } {
            0 => Ok(()),
            code => Err(ModuleError::EntryPointFailed { path: self.path.clone(), code }),
        }
    }

    fn applet_widget(&self, factory_id: &str, uid: u32) -> Option<WidgetPtr> {
        let factory_id = CString::new(factory_id).ok()?;
        WidgetPtr::new(unsafe { (self.get_widget)(factory_id.as_ptr(), uid) })
    }
}

impl Drop for DlModule {
    fn drop(&mut self) {
        log::debug!("Closing module {}", self.path.display());
        unsafe { libc::dlclose(self.handle) };
    }
}

impl std::fmt::Debug for DlModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DlModule").field("path", &self.path).finish_non_exhaustive()
    }
}

fn last_dl_error() -> String {
    let error = unsafe { libc::dlerror() };
    if error.is_null() {
        "unknown error".to_string()
    } else {
        unsafe { CStr::from_ptr(error) }.to_string_lossy().into_owned()
    }
}
