// SPDX-License-Identifier: Apache-2.0

use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "kpitail", version, about = "Log-tailing KPI metrics daemon")]
pub struct Arguments {
    /// Path to the daemon configuration file
    #[arg(long, env = "KPITAIL_CONFIG", default_value = "config.yaml")]
    pub config: PathBuf,

    /// Log level filter (e.g. info, debug, kpitail=debug)
    #[arg(long, env = "KPITAIL_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_flag_defaults_to_config_yaml() {
        let args = Arguments::parse_from(["kpitail"]);
        assert_eq!(args.config, PathBuf::from("config.yaml"));
        assert_eq!(args.log_level, "info");
    }

    #[test]
    fn config_flag_overrides_default() {
        let args = Arguments::parse_from(["kpitail", "--config", "/etc/kpitail.yaml"]);
        assert_eq!(args.config, PathBuf::from("/etc/kpitail.yaml"));
    }
}
