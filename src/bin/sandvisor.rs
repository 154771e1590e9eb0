//! sandvisor CLI tool
//!
//! Boots an ELF guest under KVM with its file access confined to a set of
//! host directories.

use std::fs::File;
use std::path::PathBuf;
use std::process;
use std::time::Instant;

use clap::Parser;
use object::ReadCache;

use sandvisor::{debug, Container, Machine, StopReason};

#[derive(Parser, Debug)]
#[command(name = "sandvisor")]
#[command(version, about = "Run an ELF guest in a sandboxed KVM machine", long_about = None)]
struct Cli {
    /// Guest kernel (ELF)
    #[arg(long)]
    kernel: PathBuf,

    /// Guest memory, with an optional G, M, K or B suffix
    #[arg(long, default_value = "2G", value_parser = parse_mem)]
    mem: u64,

    /// Colon-separated directories the guest may open files under
    #[arg(long, default_value = ".")]
    dir: String,

    /// Let the guest open any host path
    #[arg(long, conflicts_with = "dir")]
    unrestricted: bool,

    /// Single-step the guest and log every instruction
    #[arg(long)]
    trace: bool,

    /// Number of virtual CPUs
    #[arg(long, default_value_t = 1)]
    cpus: usize,

    /// Arguments passed to the guest
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

/// Parse a size such as `2G`, `512M`, `64k` or `4096B`.
fn parse_mem(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, suffix) = s.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid memory size: {:?}", s))?;
    let shift = match suffix.to_ascii_uppercase().as_str() {
        "G" => 30,
        "M" => 20,
        "K" => 10,
        "B" | "" => 0,
        other => return Err(format!("unknown size suffix: {:?}", other)),
    };
    value
        .checked_mul(1 << shift)
        .ok_or_else(|| format!("memory size overflows: {:?}", s))
}

fn main() {
    debug::init();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => {}
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let container = if cli.unrestricted {
        Container::unrestricted()
    } else {
        Container::new(cli.dir.split(':').filter(|d| !d.is_empty()))?
    };

    let mut machine = Machine::builder()
        .memory(cli.mem)
        .vcpus(cli.cpus)
        .trace(cli.trace)
        .container(container)
        .build()?;

    let file = File::open(&cli.kernel)
        .map_err(|e| format!("cannot open {}: {}", cli.kernel.display(), e))?;
    let image = ReadCache::new(file);

    let mut args = vec![cli.kernel.display().to_string()];
    args.extend(cli.args);
    machine.load_kernel(&image, &args)?;

    let start = Instant::now();
    let reasons = machine.boot()?;
    eprintln!("time: {:.3}s", start.elapsed().as_secs_f64());

    for (cpu, reason) in reasons.iter().enumerate() {
        match reason {
            StopReason::Halted => eprintln!("vcpu{}: halted", cpu),
            StopReason::Exited(code) => eprintln!("vcpu{}: exited with status {}", cpu, *code as i64),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_mem() {
        assert_eq!(parse_mem("2G"), Ok(2 << 30));
        assert_eq!(parse_mem("512M"), Ok(512 << 20));
        assert_eq!(parse_mem("64k"), Ok(64 << 10));
        assert_eq!(parse_mem("4096B"), Ok(4096));
        assert_eq!(parse_mem("4096"), Ok(4096));
        assert!(parse_mem("12X").is_err());
        assert!(parse_mem("G").is_err());
        assert!(parse_mem("99999999999999G").is_err());
    }

    #[test]
    fn test_defaults_and_guest_args() {
        let cli = Cli::try_parse_from(["sandvisor", "--kernel", "k.elf", "hello", "-v"]).unwrap();
        assert_eq!(cli.mem, 2 << 30);
        assert_eq!(cli.dir, ".");
        assert_eq!(cli.cpus, 1);
        assert!(!cli.trace);
        assert_eq!(cli.args, vec!["hello", "-v"]);
    }

    #[test]
    fn test_kernel_required() {
        assert!(Cli::try_parse_from(["sandvisor"]).is_err());
    }
}
