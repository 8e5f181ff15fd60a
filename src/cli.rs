use std::time::Duration;

use clap::Parser;

use crate::network::ClientConfig;
use crate::orchestrator::MeasureConfig;

/// natprobe cli
///
/// Reads seed URLs from stdin, one per line, and prints the number of
/// concurrent server connections the path to the internet sustained.
#[derive(Parser)]
#[command(name = "natprobe")]
#[command(about = "Measure how many concurrent outbound connections a CGNAT will keep alive")]
#[command(version)]
pub struct Cli {
    /// keep-alive budget
    #[arg(
        long,
        default_value_t = 3.5,
        help = "Seconds between requests on an idle connection; keeps NAT mappings from expiring (min 1.0)"
    )]
    pub keep_alive_secs: f64,

    /// worker cap
    #[arg(
        long,
        help = "Upper bound on concurrent resolver/fetch workers (default: grows with the seed list)"
    )]
    pub max_workers: Option<usize>,

    /// saturation threshold
    #[arg(
        long,
        default_value_t = 5,
        help = "Consecutive dial failures treated as NAT saturation"
    )]
    pub dial_fail_limit: u32,

    /// request timeout
    #[arg(long, default_value_t = 10, help = "Timeout in seconds for each request")]
    pub timeout: u64,

    /// connect timeout
    #[arg(long, default_value_t = 1, help = "TCP connect timeout in seconds")]
    pub connect_timeout: u64,

    /// secondary stop condition
    #[arg(
        long,
        help = "Also stop once every seed host is accounted for (closed topologies only)"
    )]
    pub seed_coverage_stop: bool,
}

impl Cli {
    /// parse args
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn measure_config(&self) -> MeasureConfig {
        MeasureConfig {
            keep_alive: Duration::from_secs_f64(self.keep_alive_secs.max(1.0)),
            max_workers: self.max_workers,
            dial_fail_limit: self.dial_fail_limit,
            seed_coverage_stop: self.seed_coverage_stop,
            client: ClientConfig {
                request_timeout: Duration::from_secs(self.timeout),
                connect_timeout: Duration::from_secs(self.connect_timeout),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_measurement_policy() {
        let cli = Cli::parse_from(["natprobe"]);
        let config = cli.measure_config();
        assert_eq!(config.keep_alive, Duration::from_millis(3500));
        assert_eq!(config.dial_fail_limit, 5);
        assert_eq!(config.max_workers, None);
        assert!(!config.seed_coverage_stop);
    }

    #[test]
    fn test_keep_alive_clamped_to_one_second() {
        let cli = Cli::parse_from(["natprobe", "--keep-alive-secs", "0.2"]);
        assert_eq!(cli.measure_config().keep_alive, Duration::from_secs(1));
    }

    #[test]
    fn test_flags_flow_through() {
        let cli = Cli::parse_from([
            "natprobe",
            "--max-workers",
            "32",
            "--dial-fail-limit",
            "9",
            "--seed-coverage-stop",
        ]);
        let config = cli.measure_config();
        assert_eq!(config.max_workers, Some(32));
        assert_eq!(config.dial_fail_limit, 9);
        assert!(config.seed_coverage_stop);
    }
}
