use std::path::PathBuf;

use clap::{Parser, Subcommand};

// ///////////// //
// CLI interface //
// ///////////// //

/// printer-keepalive - A service that keeps idle network printers healthy by printing a small keepalive page when they have not printed for a while.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (YAML, TOML or JSON). Defaults to `PKA_CONFIG_FILE` when set.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Runs the scheduler and the MQTT bridge until interrupted (default).
    Run,
    /// Polls every printer once and prints the health report as JSON.
    Health,
    /// Prints a keepalive page on one printer.
    Print {
        printer_id: String,
        /// Only print when the keepalive is due.
        #[arg(long)]
        if_due: bool,
    },
    /// Polls one printer and prints its state as JSON.
    Poll { printer_id: String },
    /// Probes the discovery candidates and prints suggested printer configs.
    Discover,
    /// Dumps every IPP printer attribute of one printer to stdout.
    Dump { printer_id: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_print_with_flag() {
        let cli = Cli::parse_from(["printer-keepalive", "print", "office", "--if-due"]);
        assert!(matches!(cli.command, Some(Commands::Print { ref printer_id, if_due: true }) if printer_id == "office"));
    }

    #[test]
    fn no_subcommand_means_run() {
        let cli = Cli::parse_from(["printer-keepalive", "--config", "keepalive.yaml"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.config, Some(PathBuf::from("keepalive.yaml")));
    }
}
