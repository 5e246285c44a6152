use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use lvgrid::debug::format_per_phase;
use lvgrid::demo::{sample_compensator, sample_feeder, sample_regulator};
use lvgrid::{
    calculate, run_profile, CalcOptions, CalculationResult, CompensationMode, DemandLevel,
    EquipmentSet, LoadModel, RadialSweep, Scenario, ThermalWindow,
};

/// Unbalanced LV feeder calculation with voltage regulators and neutral
/// compensators.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate the sample feeder once.
    #[clap(name = "calc")]
    Calculate(CalcArgs),

    /// Evaluate the sample feeder over a daily demand profile.
    Profile(CalcArgs),
}

#[derive(Args)]
struct CalcArgs {
    /// Install the sample regulator at n2.
    #[arg(long, default_value_t = false)]
    regulator: bool,

    /// Install the sample compensator at n3.
    #[arg(long, default_value_t = false)]
    compensator: bool,

    /// Calculation scenario.
    #[arg(long, value_enum)]
    scenario: Option<Scenario>,

    /// Phase distribution model.
    #[arg(long, value_enum)]
    load_model: Option<LoadModel>,

    /// Demand factor applied to loads.
    #[arg(long)]
    load_factor: Option<f64>,

    /// Factor applied to productions.
    #[arg(long)]
    production_factor: Option<f64>,

    /// Thermal window of the compensator.
    #[arg(long, value_enum)]
    window: Option<ThermalWindow>,

    /// Compensation mode.
    #[arg(long, value_enum)]
    mode: Option<CompensationMode>,
}

fn main() {
    env_logger::Builder::from_default_env()
        .format_level(false)
        .format_target(false)
        .format_timestamp(None)
        .init();

    let cli = Cli::parse();

    match execute(&cli) {
        Ok(_) => {
            std::process::exit(0);
        }
        Err(err) => {
            eprintln!("error: {}", err);
            std::process::exit(2);
        }
    }
}

fn execute(cli: &Cli) -> Result<()> {
    let args = match &cli.command {
        Commands::Calculate(args) => args,
        Commands::Profile(args) => args,
    };

    let mut options = CalcOptions::default();
    if let Some(scenario) = args.scenario {
        options.scenario = scenario;
    }
    if let Some(load_model) = args.load_model {
        options.load_model = load_model;
    }
    if let Some(f) = args.load_factor {
        options.load_factor = f;
    }
    if let Some(f) = args.production_factor {
        options.production_factor = f;
    }

    let mut equipment = EquipmentSet::default();
    if args.regulator {
        equipment = equipment.with_regulator(sample_regulator()?);
    }
    if args.compensator {
        let mut comp = sample_compensator()?;
        if let Some(window) = args.window {
            comp.window = window;
        }
        if let Some(mode) = args.mode {
            comp.mode = mode;
        }
        equipment = equipment.with_compensator(comp);
    }

    let network = sample_feeder();
    let solver = RadialSweep;

    match &cli.command {
        Commands::Calculate(_) => {
            let result = calculate(&network, &options, &equipment, &solver)?;
            print_result(&result);
        }
        Commands::Profile(_) => {
            let levels: Vec<DemandLevel> = [0.3, 0.25, 0.4, 0.7, 0.6, 0.9, 1.0, 0.5]
                .iter()
                .enumerate()
                .map(|(i, &f)| DemandLevel::new(&format!("{:02}h", i * 3), f, 1.0 - f))
                .collect();
            let results = run_profile(&network, &options, &equipment, &levels, &solver)?;
            println!("{:>6} {:>8} {:>28} {:>14}", "level", "factor", "V(n3) [A, B, C]", "status");
            for (level, r) in levels.iter().zip(&results) {
                let v = r.voltage("n3").unwrap_or_default();
                println!(
                    "{:>6} {:>8.2} {:>28} {:>14}",
                    level.label,
                    level.load_factor,
                    format_per_phase(&v),
                    r.status.to_string()
                );
            }
        }
    }

    Ok(())
}

fn print_result(r: &CalculationResult) {
    println!("status: {} ({} iterations)", r.status, r.iterations);
    println!();
    println!("{:<6} {:>28} {:>10}", "node", "V [A, B, C]", "imb. %");
    for (id, n) in &r.nodes {
        println!(
            "{:<6} {:>28} {:>10.2}",
            id,
            format_per_phase(&n.voltage),
            n.imbalance_percent
        );
    }
    println!();
    println!("{:<6} {:>28} {:>10} {:>8}", "cable", "I [A, B, C]", "I_N", "load %");
    for (id, c) in &r.cables {
        println!(
            "{:<6} {:>28} {:>10.2} {:>8.1}",
            id,
            format_per_phase(&c.current),
            c.neutral_current,
            c.loading_percent
        );
    }
    for reg in &r.regulators {
        println!();
        println!(
            "regulator {} at {}: [{}, {}, {}] in {} out {}",
            reg.id,
            reg.node,
            reg.state.0[0],
            reg.state.0[1],
            reg.state.0[2],
            format_per_phase(&reg.input_voltage),
            format_per_phase(&reg.output_voltage)
        );
    }
    for comp in &r.compensators {
        println!();
        println!(
            "compensator {} at {}: {:.1} A, spread {:.2} V -> {:.2} V (target {:.2} V)",
            comp.id, comp.node, comp.injected_current, comp.natural_spread, comp.achieved_spread,
            comp.target_spread
        );
    }
    if !r.diagnostics.is_empty() {
        println!();
        for d in &r.diagnostics {
            println!("note: {}", d);
        }
    }
}
