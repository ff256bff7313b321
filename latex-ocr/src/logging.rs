/// Installs the process-wide logger.
///
/// Log level is Debug in development builds and Info in production builds.
/// `RUST_LOG` overrides it; `verbose` forces Debug for this crate.
pub fn init(verbose: bool) {
    let default_level = if cfg!(debug_assertions) || verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    let mut builder = env_logger::Builder::new();
    builder
        .filter_level(log::LevelFilter::Warn)
        .filter_module("latex_ocr_lib", default_level)
        .filter_module("latex_ocr_rpc", default_level)
        .filter_module("latex_ocr", default_level)
        .parse_default_env();

    if let Err(e) = builder.try_init() {
        log::warn!("Logger already initialized: {}", e);
    }
}
