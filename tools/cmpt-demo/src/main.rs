//! cmpt demo
//!
//! Wraps a two-argument adder in a compartment, calls it through its handle
//! and prints the stack pointer before, during and after the call.

use std::path::PathBuf;
use std::time::Instant;

use clap::{Parser, ValueEnum};
use cmpt_manager::{
    seed_from, Capability, CompartmentFlags, CompartmentManager, HalError, MachineConfig, ManagerConfig,
    ObjectType, Perms, Prot, SealingScheme, HAL,
};
use serde::Deserialize;

/// Run a function inside a compartment
#[derive(Parser, Debug)]
#[command(name = "cmpt-demo")]
#[command(version, about, long_about = None)]
struct Cli {
    /// JSON file with `machine` and `manager` sections
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Sealing scheme for compartment handles (overrides the config file)
    #[arg(long, value_enum)]
    scheme: Option<Scheme>,

    /// Pages in the compartment stack
    #[arg(long, default_value_t = 1)]
    stack_pages: u64,

    /// First compartment identity (picked from the platform when absent)
    #[arg(long)]
    seed: Option<u64>,

    /// First operand
    #[arg(long, default_value_t = 2)]
    x: u32,

    /// Second operand
    #[arg(long, default_value_t = 3)]
    y: u32,

    /// Print the audit trail as JSON when done
    #[arg(long)]
    audit_json: bool,

    /// Print manager debug messages
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Scheme {
    Lpb,
    Lb,
}

impl From<Scheme> for SealingScheme {
    fn from(scheme: Scheme) -> Self {
        match scheme {
            Scheme::Lpb => SealingScheme::Lpb,
            Scheme::Lb => SealingScheme::Lb,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DemoConfig {
    machine: MachineConfig,
    manager: ManagerConfig,
}

/// HAL backed by the process clock and stderr.
struct ConsoleHal {
    start: Instant,
    verbose: bool,
}

impl HAL for ConsoleHal {
    fn now_nanos(&self) -> u64 {
        self.start.elapsed().as_nanos() as u64
    }

    fn random_bytes(&self, _buf: &mut [u8]) -> Result<(), HalError> {
        Err(HalError::NotSupported)
    }

    fn debug_write(&self, msg: &str) {
        if self.verbose {
            eprintln!("{}", msg);
        }
    }
}

/// Identities a picked seed starts from, leaving room for many compartments.
const SEED_SPAN: u64 = 0x1000;

fn pick_seed<H: HAL>(hal: &H) -> u64 {
    ObjectType::FIRST_USER + seed_from(hal) % SEED_SPAN
}

fn load_config(cli: &Cli) -> Result<DemoConfig, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)?;
            serde_json::from_str(&text)?
        }
        None => DemoConfig::default(),
    };
    if let Some(scheme) = cli.scheme {
        config.manager.scheme = scheme.into();
    }
    Ok(config)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let hal = ConsoleHal {
        start: Instant::now(),
        verbose: cli.verbose,
    };

    let seed = cli.seed.unwrap_or_else(|| pick_seed(&hal));
    let mut manager = CompartmentManager::new(hal, config.machine, config.manager)?;
    manager.init(seed)?;
    if !manager.is_initialized() {
        return Err("platform does not expose the sealing and identity roots".into());
    }

    let add = manager.register_function(|frame| {
        println!("csp in compartment: {}", frame.csp());
        let args = frame.arg();
        let x = frame.load_u32(&args, args.address())?;
        let y = frame.load_u32(&args, args.address() + 4)?;
        frame.set_result(Capability::from_int(u64::from(x) + u64::from(y)));
        Ok(())
    })?;
    let handle = manager.create_compartment(add, cli.stack_pages, &CompartmentFlags::default())?;

    let buffer = manager.machine_mut().mmap(8, Prot::RW, Prot::empty())?;
    let mut bytes = [0u8; 8];
    bytes[..4].copy_from_slice(&cli.x.to_le_bytes());
    bytes[4..].copy_from_slice(&cli.y.to_le_bytes());
    manager.machine_mut().store_bytes(&buffer, buffer.base(), &bytes)?;
    let args = buffer
        .bounds_set_exact(8)
        .perms_and(Perms::GLOBAL | Perms::LOAD);

    println!("compartment seed:   {}", seed);
    println!("csp before call:    {}", manager.machine().regs().csp());
    let result = manager.invoke(&handle, args)?;
    println!("csp after call:     {}", manager.machine().regs().csp());
    println!("result: {} + {} = {}", cli.x, cli.y, result.address());

    manager.destroy_compartment(&handle)?;

    if cli.audit_json {
        println!("{}", serde_json::to_string_pretty(&manager.audit.snapshot())?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_picked_seed_is_a_user_object_type() {
        let hal = ConsoleHal {
            start: Instant::now(),
            verbose: false,
        };
        for _ in 0..16 {
            let seed = pick_seed(&hal);
            assert!(seed >= ObjectType::FIRST_USER);
            assert!(seed < ObjectType::FIRST_USER + SEED_SPAN);
        }
    }

    #[test]
    fn test_explicit_seed_wins() {
        let cli = Cli::parse_from(["cmpt-demo", "--seed", "9"]);
        assert_eq!(cli.seed, Some(9));
        let cli = Cli::parse_from(["cmpt-demo"]);
        assert_eq!(cli.seed, None);
    }
}
