use chrono::{DateTime, Local};

fn build_date(format: &str) -> String {
    let build_timestamp: i64 = env!("DESKPHONE_BUILD_TIME").parse().unwrap_or(0);
    let build_datetime: DateTime<Local> = DateTime::from_timestamp(build_timestamp, 0)
        .map(|utc| utc.with_timezone(&Local))
        .unwrap_or_else(Local::now);
    build_datetime.format(format).to_string()
}

pub fn get_version_info() -> &'static str {
    Box::leak(
        format!(
            "deskphone {}\n\
         Build Time: {}\n\
         Git Commit: {}",
            env!("CARGO_PKG_VERSION"),
            build_date("%Y-%m-%d %H:%M:%S %Z"),
            env!("DESKPHONE_GIT_COMMIT"),
        )
        .into_boxed_str(),
    )
}

/// Value of the `User-Agent` header sent to the presence backend.
pub fn get_useragent() -> String {
    format!(
        "deskphone/{} (built {})",
        env!("CARGO_PKG_VERSION"),
        build_date("%Y-%m-%d")
    )
}
