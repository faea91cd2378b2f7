//! Embedding of out-of-process applet plug windows.

pub type PlugRemovedCallback = Box<dyn FnOnce() + Send>;

#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("X11 error: {0}")]
    X11(String),
    #[error("Socket {socket} already embeds window {plug}")]
    AlreadyEmbedding { socket: u32, plug: u32 },
}

/// A window the panel reparents an applet's plug window into.
pub trait EmbedSocket: Send {
    fn id(&self) -> u32;
    fn add_id(&mut self, xid: u32) -> Result<(), SocketError>;
    fn plug_xid(&self) -> Option<u32>;
}

/// Creates sockets. `on_plug_removed` runs at most once, when the embedded plug goes away
/// while the socket is still alive.
pub trait SocketFactory: Send + Sync {
    fn create_socket(&self, on_plug_removed: PlugRemovedCallback) -> Result<Box<dyn EmbedSocket>, SocketError>;
}

#[cfg(feature = "x11")]
pub use x11::X11SocketFactory;

#[cfg(feature = "x11")]
mod x11 {
    use std::sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    };

    use x11rb::{
        connection::Connection,
        protocol::{xproto::*, Event},
        rust_connection::{DefaultStream, RustConnection},
        COPY_DEPTH_FROM_PARENT,
    };

    use super::{EmbedSocket, PlugRemovedCallback, SocketError, SocketFactory};

    fn x11_error(e: impl std::fmt::Display) -> SocketError {
        SocketError::X11(e.to_string())
    }

    #[derive(Debug)]
    pub struct X11SocketFactory {
        screen: i32,
    }

    impl X11SocketFactory {
        pub fn new(screen: i32) -> Self {
            X11SocketFactory { screen }
        }
    }

    struct X11Socket {
        conn: Arc<RustConnection<DefaultStream>>,
        window: Window,
        plug: Arc<AtomicU32>,
        disposed: Arc<AtomicBool>,
    }

    impl SocketFactory for X11SocketFactory {
        fn create_socket(&self, on_plug_removed: PlugRemovedCallback) -> Result<Box<dyn EmbedSocket>, SocketError> {
            let (conn, default_screen) = RustConnection::connect(None).map_err(x11_error)?;
            let roots = &conn.setup().roots;
            let root = usize::try_from(self.screen)
                .ok()
                .and_then(|n| roots.get(n))
                .or_else(|| roots.get(default_screen))
                .map(|screen| screen.root)
                .ok_or_else(|| x11_error(format!("no such screen {}", self.screen)))?;

            let window = conn.generate_id().map_err(x11_error)?;
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
                &CreateWindowAux::new().event_mask(EventMask::SUBSTRUCTURE_NOTIFY | EventMask::STRUCTURE_NOTIFY),
            )
            .map_err(x11_error)?;
            conn.flush().map_err(x11_error)?;

            let conn = Arc::new(conn);
            let plug = Arc::new(AtomicU32::new(0));
            let disposed = Arc::new(AtomicBool::new(false));
            {
                let conn = conn.clone();
                let plug = plug.clone();
                let disposed = disposed.clone();
                std::thread::Builder::new()
                    .name(format!("socket-{}", window))
                    .spawn(move || watch_socket(&conn, window, &plug, &disposed, on_plug_removed))
                    .map_err(x11_error)?;
            }

            Ok(Box::new(X11Socket { conn, window, plug, disposed }))
        }
    }

    impl EmbedSocket for X11Socket {
        fn id(&self) -> u32 {
            self.window
        }

        fn add_id(&mut self, xid: u32) -> Result<(), SocketError> {
            let current = self.plug.load(Ordering::SeqCst);
            if current != 0 {
                return Err(SocketError::AlreadyEmbedding { socket: self.window, plug: current });
            }
            self.plug.store(xid, Ordering::SeqCst);
            // keep the plug alive if the panel dies
            self.conn.change_save_set(SetMode::INSERT, xid).map_err(x11_error)?;
            self.conn.reparent_window(xid, self.window, 0, 0).map_err(x11_error)?;
            self.conn.map_window(xid).map_err(x11_error)?;
            self.conn.flush().map_err(x11_error)?;
            log::debug!("Embedded plug {} into socket {}", xid, self.window);
            Ok(())
        }

        fn plug_xid(&self) -> Option<u32> {
            Some(self.plug.load(Ordering::SeqCst)).filter(|xid| *xid != 0)
        }
    }

    impl Drop for X11Socket {
        fn drop(&mut self) {
            self.disposed.store(true, Ordering::SeqCst);
            let _ = self.conn.destroy_window(self.window);
            let _ = self.conn.flush();
        }
    }

    fn watch_socket(
        conn: &RustConnection<DefaultStream>,
        socket: Window,
        plug: &AtomicU32,
        disposed: &AtomicBool,
        on_plug_removed: PlugRemovedCallback,
    ) {
        let plug_gone = loop {
            let event = match conn.wait_for_event() {
                Ok(event) => event,
                Err(e) => {
                    log::warn!("Lost X11 connection of socket {}: {}", socket, e);
                    break false;
                }
            };
            let current_plug = plug.load(Ordering::SeqCst);
            match event {
                Event::DestroyNotify(ev) if ev.window == socket => break false,
                Event::DestroyNotify(ev) if current_plug != 0 && ev.window == current_plug => break true,
                Event::ReparentNotify(ev) if current_plug != 0 && ev.window == current_plug && ev.parent != socket => {
                    break true
                }
                _ => {}
            }
        };
        if plug_gone && !disposed.load(Ordering::SeqCst) {
            log::debug!("Plug of socket {} was removed", socket);
            on_plug_removed();
        }
    }
}
