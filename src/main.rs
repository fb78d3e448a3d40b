use std::env;
use std::process::ExitCode;

use byte_unit::Byte;
use flash_sim::config::Lpn;
use flash_sim::{Config, Simulator};
use log::{error, info, LevelFilter};
use rand::prelude::*;
use simplelog::{ConfigBuilder, SimpleLogger};
use time::macros::format_description;

const RANDOM_PASSES: usize = 4;
/// One random operation in this many is a trim instead of a write.
const TRIM_EVERY: u32 = 16;

fn main() -> ExitCode {
    let mut args = env::args().skip(1);
    let config_path = args.next();
    let level = args
        .next()
        .and_then(|l| l.parse().ok())
        .unwrap_or(LevelFilter::Info);

    let log_cfg = ConfigBuilder::new()
        .set_time_format_custom(format_description!("[hour]:[minute]:[second].[subsecond]"))
        .build();

    if let Err(e) = SimpleLogger::init(level, log_cfg) {
        eprintln!("cannot set up logging: {}", e);
        return ExitCode::FAILURE;
    }

    match run(config_path) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(config_path: Option<String>) -> flash_sim::Result<()> {
    let config = match config_path {
        Some(path) => Config::from_json_file(path)?,
        None => Config::default(),
    };
    let mut sim = Simulator::new(&config)?;
    let max_lba = sim.get_max_lba();

    let physical = Byte::from_bytes(config.capacity_bytes() as u128);
    let user = Byte::from_bytes((config.logical_pages() * config.page_size) as u128);
    info!(
        "{} policy, physical {}, user {}",
        sim.controller().policy_name(),
        physical.get_appropriate_unit(true),
        user.get_appropriate_unit(true)
    );

    for lba in 0..=max_lba {
        sim.write(lba)?;
    }
    sim.drain()?;
    info!("Drive preconditioned");

    let mut rng: SmallRng = SmallRng::seed_from_u64(7);

    for c in 0..RANDOM_PASSES {
        for _ in 0..=max_lba {
            let lba: Lpn = rng.gen_range(0..=max_lba);
            if rng.gen_ratio(1, TRIM_EVERY) {
                sim.trim(lba)?;
            } else {
                sim.write(lba)?;
            }
        }
        info!(
            "Capacity {} randomly written, write amplification {:.4}",
            c,
            sim.controller().stats().write_amplification()
        );
    }
    sim.drain()?;

    info!(
        "finished at {}us, free blocks per LUN {:?}",
        sim.now(),
        sim.controller().pool().free_block_counts()
    );
    println!("{}", sim.controller().stats());
    Ok(())
}
