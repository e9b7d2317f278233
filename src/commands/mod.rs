pub mod config;
pub mod parse;
pub mod run;

pub use config::handle_config;
pub use parse::handle_parse;
pub use run::{RunOverrides, handle_run};
