//! Entry points of in-process applet modules.
//!
//! The panel `dlopen`s the module and resolves `_cafe_panel_applet_shlib_factory`, which starts
//! the factory, and `cafe_panel_applet_get_applet_widget`, which hands out the widget of an
//! applet created by it. Modules export both with [`in_process_factory!`](crate::in_process_factory).

use std::{
    collections::HashMap,
    ffi::{c_char, c_int, c_uint, c_void, CStr},
    ptr::NonNull,
    sync::{mpsc, Mutex},
};

use once_cell::sync::Lazy;

use crate::{Applet, AppletFactory, FactoryPhase, Result};

/// Opaque pointer to the toolkit widget of an in-process applet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WidgetPtr(NonNull<c_void>);

// The pointer is only ever dereferenced by the toolkit on the panel's main thread.
unsafe impl Send for WidgetPtr {}
unsafe impl Sync for WidgetPtr {}

impl WidgetPtr {
    pub fn new(ptr: *mut c_void) -> Option<Self> {
        NonNull::new(ptr).map(WidgetPtr)
    }

    pub fn as_ptr(self) -> *mut c_void {
        self.0.as_ptr()
    }
}

static FACTORIES: Lazy<Mutex<HashMap<String, AppletFactory>>> = Lazy::new(Default::default);

/// Start the in-process factory `factory_id` on its own thread. Returns 0 on success.
///
/// Activating a factory that is already serving is a no-op.
pub fn activate(factory_id: &str, setup: impl Fn(&Applet, &str) -> bool + Send + Sync + 'static) -> c_int {
    let running = FACTORIES.lock().unwrap().get(factory_id).map(AppletFactory::phase); // unwrap: mutex poisoning is okay
    if running == Some(FactoryPhase::Active) {
        log::debug!("In-process factory {} is already active", factory_id);
        return 0;
    }

    let factory = AppletFactory::new(factory_id, false, setup);
    match spawn_factory(factory.clone()) {
        Ok(()) => {
            FACTORIES.lock().unwrap().insert(factory_id.to_string(), factory); // unwrap: mutex poisoning is okay
            0
        }
        Err(e) => {
            log::error!("Failed to start in-process factory {}: {}", factory_id, e);
            1
        }
    }
}

/// Run the factory on a dedicated thread and wait until it is activated.
fn spawn_factory(factory: AppletFactory) -> Result<()> {
    let (result_tx, result_rx) = mpsc::channel();
    let thread_name = format!("factory-{}", factory.factory_id());
    let spawned = std::thread::Builder::new().name(thread_name).spawn(move || {
        let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(rt) => rt,
            Err(e) => {
                let _ = result_tx.send(Err(crate::Error::FactoryThread(format!("could not start runtime: {}", e))));
                return;
            }
        };
        rt.block_on(async move {
            let activated: Result<zbus::Connection> = async {
                let con = zbus::Connection::session().await?;
                factory.activate(&con).await?;
                Ok(con)
            }
            .await;
            match activated {
                Ok(_con) => {
                    let _ = result_tx.send(Ok(()));
                    factory.wait_for_shutdown().await;
                }
                Err(e) => {
                    let _ = result_tx.send(Err(e));
                }
            }
        });
    });
    if let Err(e) = spawned {
        return Err(crate::Error::FactoryThread(format!("could not spawn thread: {}", e)));
    }
    result_rx.recv().unwrap_or_else(|_| Err(crate::Error::FactoryThread("exited before activation".to_string())))
}

/// Look up the widget of applet `uid` of the in-process factory `factory_id`.
///
/// # Safety
///
/// `factory_id` must be null or point to a valid nul-terminated string.
pub unsafe fn applet_widget(factory_id: *const c_char, uid: c_uint) -> *mut c_void {
    if factory_id.is_null() {
        return std::ptr::null_mut();
    }
    let Ok(factory_id) = CStr::from_ptr(factory_id).to_str() else {
        return std::ptr::null_mut();
    };
    lookup_widget(factory_id, uid).map(WidgetPtr::as_ptr).unwrap_or(std::ptr::null_mut())
}

fn lookup_widget(factory_id: &str, uid: u32) -> Option<WidgetPtr> {
    let factory = FACTORIES.lock().unwrap().get(factory_id).cloned(); // unwrap: mutex poisoning is okay
    match factory.and_then(|factory| factory.applet(uid)) {
        Some(applet) => applet.widget(),
        None => {
            log::warn!("No applet with uid {} in in-process factory {}", uid, factory_id);
            None
        }
    }
}

/// Export the in-process module entry points for a factory.
///
/// ```ignore
/// cafe_panel_applet::in_process_factory!("ClockAppletFactory", |applet, applet_id| {
///     applet.set_widget(build_clock(applet_id));
///     true
/// });
/// ```
#[macro_export]
macro_rules! in_process_factory {
    ($factory_id:expr, $setup:expr $(,)?) => {
        #[no_mangle]
        pub extern "C" fn _cafe_panel_applet_shlib_factory() -> ::std::ffi::c_int {
            $crate::shlib::activate($factory_id, $setup)
        }

        /// # Safety
        ///
        /// `factory_id` must be null or a valid nul-terminated string.
        #[no_mangle]
        pub unsafe extern "C" fn cafe_panel_applet_get_applet_widget(
            factory_id: *const ::std::ffi::c_char,
            uid: ::std::ffi::c_uint,
        ) -> *mut ::std::ffi::c_void {
            $crate::shlib::applet_widget(factory_id, uid)
        }
    };
}
