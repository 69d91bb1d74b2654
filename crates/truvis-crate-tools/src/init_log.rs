use std::io::Write;

/// 使用默认的 Info 级别初始化日志
///
/// 环境变量 `RUST_LOG` 存在时会覆盖默认的过滤规则
pub fn init_log() {
    init_log_with_level(log::LevelFilter::Info);
}

/// 指定默认的日志级别，重复调用时只有第一次生效（便于测试中多次调用）
pub fn init_log_with_level(level: log::LevelFilter) {
    let _ = env_logger::Builder::new()
        .format(|buf, record| {
            let level_style = match record.level() {
                log::Level::Info => buf
                    .default_level_style(log::Level::Info)
                    .fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Green))),
                log::Level::Warn => buf
                    .default_level_style(log::Level::Warn)
                    .fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Yellow))),
                log::Level::Error => buf
                    .default_level_style(log::Level::Error)
                    .fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Red))),
                lv => buf.default_level_style(lv),
            };
            let location_style = anstyle::Style::new().fg_color(Some(anstyle::Color::Rgb(anstyle::RgbColor(110, 110, 110))));

            let time = chrono::Local::now().format("%H:%M:%S%.3f");
            let target = record.target();
            let file = record.file().and_then(|f| f.rsplit(['/', '\\']).next()).unwrap_or("");
            let line = record.line().unwrap_or(0);

            writeln!(
                buf,
                "{level_style}[{time}] {:<5} {target}: {}{level_style:#} {location_style}({file}:{line}){location_style:#}",
                record.level(),
                record.args()
            )
        })
        .filter(None, level)
        .parse_default_env()
        .try_init();
}
