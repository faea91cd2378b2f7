pub mod names;
pub mod proxy;
pub mod shlib;

mod applet;
pub use applet::*;

mod background;
pub use background::*;

mod error;
pub use error::*;

mod factory;
pub use factory::*;

mod interface;
pub use interface::*;

mod menu;
pub use menu::*;

mod platform;
pub use platform::*;

mod plug;
pub use plug::*;

mod props;
pub use props::*;

mod types;
pub use types::*;
