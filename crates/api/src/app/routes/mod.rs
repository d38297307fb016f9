pub mod plugins;
pub mod system;
