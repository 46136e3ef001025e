// config module: TOML settings and their discovery.

pub mod loader;
pub mod types;
