//! Binary entrypoint for the hierarchy tool

use colored::Colorize;

fn main() {
    if let Err(err) = hierarchy::cli::run() {
        eprintln!("{} {}", "error:".red().bold(), err);
        std::process::exit(1);
    }
}
