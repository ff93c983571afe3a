use std::io::Write;

use env_logger::DEFAULT_FILTER_ENV;
use env_logger::fmt::style::{AnsiColor, Color, Style};
use log::LevelFilter;

/// Initializes the global logger.
///
/// `--debug` (or a `RUST_LOG` filter mentioning debug) switches to the long
/// format that also names the module of each record.
pub fn setup_logging(debug: bool) {
    let verbose = debug
        || std::env::var(DEFAULT_FILTER_ENV)
            .map(|filter| filter.contains("debug") || filter.contains("trace"))
            .unwrap_or(false);

    let mut builder = env_logger::Builder::default();
    builder.filter_level(if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });
    builder.format(move |buf, record| {
        let level_style = buf.default_level_style(record.level()).bold();
        let dim = Style::new().fg_color(Some(Color::Ansi(AnsiColor::BrightBlack)));
        let now = chrono::Local::now();
        if verbose {
            writeln!(
                buf,
                "{dim}{}{dim:#} {level_style}{:<5}{level_style:#} {dim}{}{dim:#} {}",
                now.format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        } else {
            writeln!(
                buf,
                "{dim}{}{dim:#} {level_style}{}{level_style:#} {}",
                now.format("%m/%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        }
    });

    builder.parse_default_env();
    builder.init();
}
