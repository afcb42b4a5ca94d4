use std::path::PathBuf;

use clap::Parser;

/// Mirror a live HLS media playlist into a local directory
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// URL of the live media playlist
    #[arg(value_name = "PLAYLIST_URL")]
    pub playlist_url: String,

    /// Directory receiving the segments and the client playlist
    #[arg(short, long, default_value = ".")]
    pub output_dir: PathBuf,

    /// File name of the client playlist inside the output directory
    #[arg(long, default_value = mirror_engine::config::DEFAULT_PLAYLIST_FILENAME)]
    pub playlist_name: String,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,

    /// User agent sent with every request
    #[arg(long, default_value = mirror_engine::config::DEFAULT_USER_AGENT)]
    pub user_agent: String,

    /// Extra request header, e.g. "Referer: https://example.com/" (repeatable)
    #[arg(short = 'H', long = "header", value_name = "NAME:VALUE", value_parser = parse_header)]
    pub headers: Vec<(String, String)>,

    /// Proxy URL applied to every request
    #[arg(long)]
    pub proxy: Option<String>,

    /// Seconds to wait before polling again after a failed playlist fetch
    #[arg(long, default_value_t = 2)]
    pub retry_interval: u64,

    /// Request timeout in seconds, 0 disables it
    #[arg(long, default_value_t = 60)]
    pub timeout: u64,

    /// Connection timeout in seconds
    #[arg(long, default_value_t = 30)]
    pub connect_timeout: u64,
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected NAME:VALUE, got `{raw}`"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("missing header name in `{raw}`"));
    }
    Ok((name.to_owned(), value.trim().to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_header_with_colon_in_value() {
        assert_eq!(
            parse_header("Referer: http://h/live/").expect("header"),
            ("Referer".to_owned(), "http://h/live/".to_owned())
        );
    }

    #[test]
    fn rejects_header_without_separator() {
        assert!(parse_header("Referer").is_err());
        assert!(parse_header(": value").is_err());
    }

    #[test]
    fn parses_full_command_line() {
        let args = Args::try_parse_from([
            "hlsmirror",
            "http://h/live/stream.m3u8",
            "-o",
            "/srv/live",
            "-H",
            "Referer: http://h/",
            "-H",
            "Origin: http://h",
            "--retry-interval",
            "5",
            "--connect-timeout",
            "10",
        ])
        .expect("valid args");
        assert_eq!(args.playlist_url, "http://h/live/stream.m3u8");
        assert_eq!(args.output_dir, PathBuf::from("/srv/live"));
        assert_eq!(args.headers.len(), 2);
        assert_eq!(args.retry_interval, 5);
        assert_eq!(args.connect_timeout, 10);
        assert_eq!(args.timeout, 60);
        assert_eq!(args.playlist_name, "stream.m3u8");
        assert!(!args.verbose);
    }

    #[test]
    fn verbose_conflicts_with_quiet() {
        assert!(Args::try_parse_from(["hlsmirror", "http://h/x.m3u8", "-v", "-q"]).is_err());
    }
}
