use crate::{Applet, Result};

pub type EmbeddedCallback = Box<dyn FnOnce() + Send>;

/// A toplevel window an out-of-process applet draws into, embedded by the panel's socket.
pub trait Plug: Send {
    fn xid(&self) -> u32;
}

/// Creates plug windows for out-of-process applets.
///
/// `on_embedded` must be called once the panel has embedded the plug. Destruction of the plug
/// window has to destroy the applet.
pub trait PlugProvider: Send + Sync {
    fn create_plug(&self, applet: &Applet, screen: i32, on_embedded: EmbeddedCallback) -> Result<Box<dyn Plug>>;
}

#[cfg(feature = "x11")]
pub use x11::X11PlugProvider;

#[cfg(feature = "x11")]
mod x11 {
    use std::sync::Arc;

    use x11rb::{
        connection::Connection,
        protocol::{xproto::*, Event},
        rust_connection::{DefaultStream, RustConnection},
        COPY_DEPTH_FROM_PARENT,
    };

    use super::{EmbeddedCallback, Plug, PlugProvider};
    use crate::{Applet, Error, Result};

    fn plug_error(e: impl std::fmt::Display) -> Error {
        Error::Plug(e.to_string())
    }

    /// Plugs backed by a 1x1 X11 window, each on its own connection with a thread watching it.
    #[derive(Debug, Default)]
    pub struct X11PlugProvider;

    struct X11Plug {
        conn: Arc<RustConnection<DefaultStream>>,
        window: Window,
    }

    impl Plug for X11Plug {
        fn xid(&self) -> u32 {
            self.window
        }
    }

    impl Drop for X11Plug {
        fn drop(&mut self) {
            // the window may already be gone if the panel destroyed it
            let _ = self.conn.destroy_window(self.window);
            let _ = self.conn.flush();
        }
    }

    impl PlugProvider for X11PlugProvider {
        fn create_plug(&self, applet: &Applet, screen: i32, on_embedded: EmbeddedCallback) -> Result<Box<dyn Plug>> {
            let (conn, default_screen) = RustConnection::connect(None).map_err(plug_error)?;
            let roots = &conn.setup().roots;
            let root = usize::try_from(screen)
                .ok()
                .and_then(|n| roots.get(n))
                .or_else(|| roots.get(default_screen))
                .map(|screen| screen.root)
                .ok_or_else(|| plug_error(format!("no such screen {}", screen)))?;

            let window = conn.generate_id().map_err(plug_error)?;
            conn.create_window(
                COPY_DEPTH_FROM_PARENT,
                window,
                root,
                0,
                0,
                1,
                1,
                0,
                WindowClass::INPUT_OUTPUT,
                0,
                &CreateWindowAux::new().event_mask(EventMask::STRUCTURE_NOTIFY),
            )
            .map_err(plug_error)?;
            conn.flush().map_err(plug_error)?;

            let conn = Arc::new(conn);
            let watcher_conn = conn.clone();
            let applet = applet.clone();
            std::thread::Builder::new()
                .name(format!("plug-{}-{}", applet.id(), applet.uid()))
                .spawn(move || watch_plug(&watcher_conn, window, root, applet, on_embedded))
                .map_err(plug_error)?;

            Ok(Box::new(X11Plug { conn, window }))
        }
    }

    fn watch_plug(conn: &RustConnection<DefaultStream>, window: Window, root: Window, applet: Applet, on_embedded: EmbeddedCallback) {
        let mut on_embedded = Some(on_embedded);
        loop {
            match conn.wait_for_event() {
                Ok(Event::ReparentNotify(ev)) if ev.window == window && ev.parent != root => {
                    if let Some(on_embedded) = on_embedded.take() {
                        log::debug!("Plug {} of {} got embedded", window, applet.id());
                        on_embedded();
                    }
                }
                Ok(Event::DestroyNotify(ev)) if ev.window == window => {
                    log::debug!("Plug {} of {} was destroyed", window, applet.id());
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    log::warn!("Lost X11 connection of plug {}: {}", window, e);
                    break;
                }
            }
        }
        applet.destroy();
    }
}
