// Core of the Ren'Py tool server: projects, builds, previews and asset generation

pub mod background;
pub mod build;
pub mod image;
pub mod locks;
pub mod preview;
pub mod project;
pub mod settings;
pub mod types;

pub use types::*;
