pub fn build_host() -> &'static str {
    option_env!("CGREAPER_BUILD_HOST").unwrap_or("unknown")
}

pub fn build_time_raw() -> &'static str {
    option_env!("CGREAPER_BUILD_TIME").unwrap_or("unknown")
}

pub fn build_time_pretty() -> String {
    format_build_time_pretty(build_time_raw())
}

/// Build times are stamped as `epoch:<secs>` by build.rs; anything else
/// (notably the "unknown" placeholder) passes through unchanged.
pub fn format_build_time_pretty(raw: &str) -> String {
    let raw = raw.trim();
    if let Some(dt) = raw
        .strip_prefix("epoch:")
        .and_then(|epoch| epoch.trim().parse::<i64>().ok())
        .and_then(|secs| chrono::DateTime::<chrono::Utc>::from_timestamp(secs, 0))
    {
        // Render in UTC, stable across environments.
        return dt.format("%Y-%m-%d %H:%M:%S").to_string();
    }
    raw.to_string()
}

pub fn banner() -> String {
    format!(
        "cgreaper {} (built on {} at {})",
        env!("CARGO_PKG_VERSION"),
        build_host(),
        build_time_pretty()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_build_times_render_in_utc() {
        assert_eq!(format_build_time_pretty("epoch:0"), "1970-01-01 00:00:00");
        assert_eq!(
            format_build_time_pretty("epoch:1700000000"),
            "2023-11-14 22:13:20"
        );
    }

    #[test]
    fn unstampable_build_times_pass_through() {
        assert_eq!(format_build_time_pretty("unknown"), "unknown");
        assert_eq!(format_build_time_pretty("epoch:soon"), "epoch:soon");
    }
}
