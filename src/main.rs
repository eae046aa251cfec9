mod cli;
mod config;
mod counter;
mod error;
mod histogram;
mod logging;
mod report;
mod sampler;
mod topology;

use std::io::{self, BufWriter};
use std::path::Path;
use std::process;

use clap::Parser;

use cli::Cli;
use config::SamplerConfig;
use error::Error;
use report::Reporter;
use topology::ThreadAffinity;

/// Build a SamplerConfig by layering: defaults → TOML file → CLI overrides.
fn build_sampler_config(config_file: Option<&Path>, cli: &Cli) -> SamplerConfig {
    let mut cfg = match config::load_config(config_file) {
        Ok(c) => c.sampler,
        Err(e) => {
            log::warn!("{}", e);
            SamplerConfig::default()
        }
    };

    if let Some(v) = cli.reps {
        cfg.reps = v;
    }
    if let Some(ref v) = cli.engines {
        cfg.engines = v.clone();
    }
    if cli.no_flag_backwards {
        cfg.flag_backwards = false;
    }

    cfg.validate();
    cfg
}

fn run(cfg: &SamplerConfig) -> Result<(), Error> {
    let set = topology::discover()?;
    let host = report::hostname()?;
    log::info!("host {}: {} usable CPUs", host, set.len());

    let stdout = io::stdout();
    let out = BufWriter::new(stdout.lock());
    let mut reporter = Reporter::new(out, host, cfg.reps, cfg.flag_backwards);

    for &kind in &cfg.engines {
        let hist = sampler::run(kind, &set, &ThreadAffinity, cfg.reps)?;
        reporter.report(kind.name(), kind.bit_width(), &set, &hist)?;
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    logging::init(&cli.log);

    let cfg = build_sampler_config(cli.config_file.as_deref(), &cli);
    if let Err(e) = run(&cfg) {
        log::error!("{}", e);
        process::exit(1);
    }
}
