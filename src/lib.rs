pub mod adapters;
pub mod config;
pub mod error;
pub mod interrupt;
pub mod loaders;
pub mod memory;
pub mod models;
pub mod prompt;
pub mod request;
pub mod upscale;

// Re-export common types
pub use config::{load_options, Options};
pub use error::{AdapterError, LoadError, UpscaleError};
pub use interrupt::Interrupt;
pub use models::{ModelFamily, Pipeline};
pub use request::ProcessingRequest;

pub mod logging {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    pub fn init_logger() {
        init_logger_with_level(LevelFilter::Info);
    }

    /// Same format as `init_logger`; `RUST_LOG` still overrides per module
    pub fn init_logger_with_level(level: LevelFilter) {
        let _ = Builder::new()
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{} [{}] - {}",
                    chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                    record.level(),
                    record.args()
                )
            })
            .filter(None, level)
            .parse_default_env()
            .try_init();
    }
}
