pub mod chain;
pub mod cli;
pub mod locator;
pub mod lookup;
pub mod probe;
pub mod relative;

pub use chain::ChainBuilder;
pub use locator::parse;
pub use lookup::lookup;
pub use relative::relative_path;

/// imgchain version as provided by environment variables at build time
pub const IMGCHAIN_VERSION: &str = match option_env!("IMGCHAIN_VERSION") {
    Some(v) => v,
    None => env!("CARGO_PKG_VERSION"),
};
